use clap::Parser as _;
use kita_hmi_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Monitor(commands::monitor::Args),
    Set(commands::set::Args),
    Click(commands::click::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description =
        std::env::var("KITA_HMI_TOOLS_LOG").unwrap_or_else(|_| String::from("info"));
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: KITA_HMI_TOOLS_LOG is not a valid log filter");
            eprintln!("  because: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Monitor(args) => end(commands::monitor::run(args)),
        Commands::Set(args) => end(commands::set::run(args)),
        Commands::Click(args) => end(commands::click::run(args)),
    }
}
