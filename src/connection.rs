use crate::modbus::{self, ModbusTCPCodec, RegisterKind};
use futures::{SinkExt, StreamExt as _};
use std::collections::BTreeMap;
use std::pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
}

/// Hands responses decoded by the worker over to whoever is waiting for them.
#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Option<modbus::Response>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn mark_timeout(&self, transaction_id: u16) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, None);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn add_response(&self, response: modbus::Response) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(response.transaction_id, Some(response));
        self.change_notify.notify_waiters();
        drop(guard);
    }

    /// Wait until the worker has either a response or a timeout for `transaction_id`.
    pub async fn wait_for(&self, transaction_id: u16) -> Option<modbus::Response> {
        loop {
            // Register interest before looking at the map so that an update landing between the
            // check and the await is not lost.
            let mut notified = pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&transaction_id) {
                    return v;
                }
            }
            notified.await;
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Address of the Modbus TCP gateway in front of the heat pump controller (`host:port`).
    #[arg(long)]
    tcp: String,

    /// The modbus device ID.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// Which register table to read from.
    #[arg(long, value_enum, default_value_t = RegisterKind::Input)]
    register_kind: RegisterKind,

    /// If the modbus response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "3s")]
    read_timeout: humantime::Duration,

    /// Reconnect, if the connection can't be established or the modbus request can't be sent in
    /// this amount of time.
    #[arg(long, default_value = "3s")]
    send_timeout: humantime::Duration,

    /// Reconnect to the modbus server after the specified number of reads timeout.
    #[arg(long, default_value = "3")]
    reconnect_after_timeouts: usize,

    /// How long to wait before attempting to connect again after a failed attempt.
    ///
    /// Requests made in the meantime fail immediately.
    #[arg(long, default_value = "5s")]
    reconnect_delay: humantime::Duration,

    /// The amount of additional time to wait between sending requests over TCP.
    ///
    /// Interacting too fast can make some Modbus TCP gateways behave poorly.
    #[arg(long, default_value = "50ms")]
    tcp_send_delay: humantime::Duration,
}

impl Args {
    pub fn register_kind(&self) -> RegisterKind {
        self.register_kind
    }
}

pub struct Connection {
    pub request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    pub worker: tokio::task::JoinHandle<Result<(), Error>>,
    pub response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    args: Args,
}

impl Connection {
    /// Spawn the connection worker. Must be called from within a tokio runtime.
    ///
    /// The TCP connection itself is established lazily by the worker and re-established whenever
    /// it breaks.
    pub fn new(args: Args) -> Connection {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker: Arc<ResponseTracker> = Default::default();
        let worker = TcpWorker {
            reconnect_countdown: args.reconnect_after_timeouts,
            args: args.clone(),
            responses: Arc::clone(&response_tracker),
        }
        .spawn(jobs);
        Self {
            request_queue,
            worker,
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            args,
        }
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    /// Send out a single request.
    ///
    /// Returns `None` if no response arrived in time.
    pub async fn send(
        &self,
        operation: modbus::Operation,
    ) -> Result<Option<modbus::Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { device_id: self.args.device_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        Ok(self.response_tracker.wait_for(transaction_id).await)
    }
}

struct TcpWorker {
    args: Args,
    responses: Arc<ResponseTracker>,
    reconnect_countdown: usize,
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

enum Exchange {
    Done,
    Reconnect,
}

impl TcpWorker {
    fn spawn(
        self,
        jobs: UnboundedReceiver<modbus::Request>,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::task::spawn(self.main_loop(jobs))
    }

    async fn main_loop(
        mut self,
        mut jobs: UnboundedReceiver<modbus::Request>,
    ) -> Result<(), Error> {
        'reconnect: loop {
            let mut io = match self.connect().await {
                Ok(io) => io,
                Err(e) => {
                    warn!(
                        message = "could not connect, will retry",
                        error = (&e as &dyn std::error::Error),
                        delay = ?*self.args.reconnect_delay
                    );
                    // Nobody should be left waiting on a connection that does not exist.
                    let mut retry = pin::pin!(tokio::time::sleep(*self.args.reconnect_delay));
                    loop {
                        tokio::select! {
                            _ = &mut retry => continue 'reconnect,
                            job = jobs.recv() => match job {
                                None => return Ok(()),
                                Some(req) => self.responses.mark_timeout(req.transaction_id),
                            },
                        }
                    }
                }
            };
            loop {
                let Some(req) = jobs.recv().await else {
                    SinkExt::<modbus::Request>::close(&mut io).await.map_err(Error::Shutdown)?;
                    return Ok(());
                };
                match self.exchange(&mut io, req).await {
                    Exchange::Done => {}
                    Exchange::Reconnect => continue 'reconnect,
                }
                tokio::time::sleep(*self.args.tcp_send_delay).await;
            }
        }
    }

    /// Send a request and wait for its response, reporting the outcome to the tracker.
    async fn exchange(&mut self, io: &mut TcpIo, req: modbus::Request) -> Exchange {
        let send = tokio::time::timeout(*self.args.send_timeout, io.send(req)).await;
        match send {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    message = "sending request failed, will reconnect",
                    error = (&e as &dyn std::error::Error)
                );
                self.responses.mark_timeout(req.transaction_id);
                return Exchange::Reconnect;
            }
            Err(_) => {
                warn!("sending a request timed out, will reconnect");
                self.responses.mark_timeout(req.transaction_id);
                return Exchange::Reconnect;
            }
        }
        let deadline = Instant::now() + *self.args.read_timeout;
        loop {
            let response = match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => return self.handle_timeout(req.transaction_id),
                Ok(None) => {
                    warn!("connection closed by the server, will reconnect");
                    self.responses.mark_timeout(req.transaction_id);
                    return Exchange::Reconnect;
                }
                Ok(Some(Err(e))) => {
                    warn!(
                        message = "could not read data from the stream, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                    self.responses.mark_timeout(req.transaction_id);
                    return Exchange::Reconnect;
                }
                Ok(Some(Ok(response))) => response,
            };
            trace!(message = "decoded a response", transaction = response.transaction_id);
            if response.transaction_id != req.transaction_id {
                // Most likely a late answer to a request that has already timed out.
                debug!(
                    message = "a response we were not expecting",
                    transaction = response.transaction_id
                );
                continue;
            }
            self.reconnect_countdown = self.args.reconnect_after_timeouts;
            self.responses.add_response(response);
            return Exchange::Done;
        }
    }

    fn handle_timeout(&mut self, transaction_id: u16) -> Exchange {
        debug!(
            message = "an inflight request timed out",
            transaction_id,
            reconnect_countdown = self.reconnect_countdown
        );
        self.responses.mark_timeout(transaction_id);
        match self.reconnect_countdown.checked_sub(1) {
            Some(new_count) => {
                self.reconnect_countdown = new_count;
                Exchange::Done
            }
            None => Exchange::Reconnect,
        }
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        let address = self.args.tcp.as_str();
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = tokio::time::timeout(*self.args.send_timeout, TcpStream::connect(&*addresses))
            .await
            .map_err(|_| Error::ConnectTimeout(address.to_string()))?
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        self.reconnect_countdown = self.args.reconnect_after_timeouts;
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }
}
