pub mod commands;
pub mod connection;
pub mod controller;
pub mod hmi;
pub mod modbus;
pub mod output;
pub mod poller;
pub mod register_link;
pub mod registers;
pub mod rfb;
