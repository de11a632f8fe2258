use crate::registers::{RegisterIndex, RegisterValue, Unit};

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

/// One register of a snapshot, decoded with the register table where the address is known.
#[derive(serde::Serialize)]
pub struct RegisterRecord {
    pub address: u16,
    pub name: Option<&'static str>,
    pub raw: RegisterValue,
    pub value: Option<f64>,
    pub unit: Option<Unit>,
}

impl RegisterRecord {
    const HEADERS: [&'static str; 5] = ["Address", "Name", "Raw", "Value", "Unit"];

    pub fn new(address: u16, raw: RegisterValue) -> Self {
        let register = RegisterIndex::from_address(address);
        let data_type = register.map(|r| r.data_type());
        Self {
            address,
            name: register.map(|r| r.name()),
            raw,
            value: data_type.zip(raw.raw()).map(|(dt, raw)| dt.decode(raw)),
            unit: data_type.map(|dt| dt.unit()),
        }
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.address.to_string(),
            self.name.unwrap_or_default().to_string(),
            self.raw.to_string(),
            self.value.map(|v| format!("{v:.1}")).unwrap_or_default(),
            self.unit.map(|u| u.to_string()).unwrap_or_default(),
        ]
    }
}

pub mod registers {
    use crate::output;
    use crate::registers::{RegisterIndex, Unit};

    /// Search and output known registers of the heat pump controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers whose address, name or description contains this.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register table")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub address: u16,
        pub name: &'static str,
        pub factor: f64,
        pub unit: Unit,
        pub description: &'static str,
    }

    impl RegisterSchema {
        pub fn all_registers() -> impl Iterator<Item = Self> {
            RegisterIndex::all().map(|register| RegisterSchema {
                address: register.address(),
                name: register.name(),
                factor: register.data_type().factor(),
                unit: register.data_type().unit(),
                description: register.description(),
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
                || self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(vec!["Address", "Name", "Scale", "Unit", "Description"])?;
        for register in RegisterSchema::all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        register.address.to_string(),
                        register.name.to_string(),
                        register.factor.to_string(),
                        register.unit.to_string(),
                        register.description.to_string(),
                    ]
                },
                || &register,
            )?;
        }
        Ok(output.commit()?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn filter_matches_names_descriptions_and_addresses() {
            let matching = |pattern: &str| {
                RegisterSchema::all_registers()
                    .filter(|r| r.is_match(pattern))
                    .map(|r| r.address)
                    .collect::<Vec<_>>()
            };
            assert_eq!(matching("setpoint"), [65, 66, 67, 68]);
            assert_eq!(matching("hot water"), [3, 67]);
            assert_eq!(matching("234"), [234]);
        }
    }
}

pub mod read {
    use super::RegisterRecord;
    use crate::connection::{self, Connection};
    use crate::output;
    use crate::poller::{self, ChunkedPoller};
    use crate::register_link::RegisterLink;
    use std::sync::Arc;

    /// Read out the configured registers once and print them.
    ///
    /// Registers that could not be read are printed as unavailable.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        poller: poller::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not output the registers")]
        Output(#[from] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let (snapshot, stats) = runtime.block_on(async {
            let connection = Arc::new(Connection::new(args.connection.clone()));
            let link = RegisterLink::new(connection, args.connection.register_kind());
            ChunkedPoller::new(link).poll(args.poller.ranges(), args.poller.chunk_size()).await
        });
        stats.log(1, snapshot.len());
        let mut output = args.output.to_output()?;
        output.table_headers(RegisterRecord::HEADERS.to_vec())?;
        for (address, value) in snapshot.iter() {
            let record = RegisterRecord::new(address, value);
            output.result(|| record.table_row(), || &record)?;
        }
        Ok(output.commit()?)
    }
}

pub mod monitor {
    use super::RegisterRecord;
    use crate::connection::{self, Connection};
    use crate::output;
    use crate::poller::{self, ChunkedPoller, Cycle, PollLoop};
    use crate::register_link::RegisterLink;
    use futures::StreamExt as _;
    use std::sync::Arc;
    use tokio_stream::wrappers::WatchStream;

    /// Read out the device periodically and print registers whenever their value changes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        poller: poller::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not output the changed registers")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct ChangeRecord<'a> {
        time: String,
        cycle: u64,
        #[serde(flatten)]
        register: &'a RegisterRecord,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(monitor(args))
    }

    async fn monitor(args: Args) -> Result<(), Error> {
        let connection = Arc::new(Connection::new(args.connection.clone()));
        let link = RegisterLink::new(connection, args.connection.register_kind());
        let running = PollLoop::new(ChunkedPoller::new(link), &args.poller).spawn();
        let mut output = args.output.to_output()?;
        let mut headers = vec!["Time", "Cycle"];
        headers.extend(RegisterRecord::HEADERS);
        output.table_headers(headers)?;

        let mut cycles = WatchStream::new(running.cycles.clone());
        let mut previous: Option<Arc<Cycle>> = None;
        while let Some(cycle) = cycles.next().await {
            let Some(cycle) = cycle else { continue };
            let time = jiff::Timestamp::now().to_string();
            for (address, value) in cycle.snapshot.iter() {
                let seen = previous.as_ref().and_then(|p| p.snapshot.get(address));
                if seen == Some(value) {
                    continue;
                }
                let register = RegisterRecord::new(address, value);
                let sequence = cycle.sequence;
                output.result(
                    || {
                        let mut row = vec![time.clone(), sequence.to_string()];
                        row.extend(register.table_row());
                        row
                    },
                    || ChangeRecord { time: time.clone(), cycle: sequence, register: &register },
                )?;
            }
            output.flush()?;
            previous = Some(cycle);
        }
        Ok(output.commit()?)
    }
}

pub mod set {
    use crate::connection::{self, Connection};
    use crate::controller::{self, Adjustment, SetpointController, SetpointError};
    use crate::hmi::{self, HmiAutomaton, Setpoint};
    use crate::poller::{self, ChunkedPoller, Cycle, PollLoop};
    use crate::register_link::RegisterLink;
    use std::sync::Arc;
    use tokio::sync::watch;
    use tokio::time::Instant;
    use tracing::{info, warn};

    /// Change a setpoint by operating the touchscreen HMI.
    ///
    /// The current value is read out first. Unless disabled, the device is read out again after
    /// the change had time to propagate and the new value is compared with the requested one.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        poller: poller::Args,
        #[clap(flatten)]
        hmi: hmi::Args,
        #[clap(flatten)]
        controller: controller::Args,
        /// Do not wait for the device to report the new setpoint.
        #[arg(long)]
        no_verify: bool,
        #[arg(value_enum)]
        setpoint: Setpoint,
        /// The new value in °C. Rounded to the nearest step.
        value: f64,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the device poller stopped unexpectedly")]
        PollerStopped,
        #[error("could not change the {0} setpoint")]
        Setpoint(Setpoint, #[source] SetpointError),
        #[error("the {setpoint} setpoint reads back as {found:?} instead of {expected}")]
        NotApplied { setpoint: Setpoint, expected: f64, found: Option<f64> },
    }

    async fn next_cycle(
        cycles: &mut watch::Receiver<Option<Arc<Cycle>>>,
    ) -> Result<Arc<Cycle>, Error> {
        loop {
            cycles.changed().await.map_err(|_| Error::PollerStopped)?;
            if let Some(cycle) = cycles.borrow_and_update().clone() {
                return Ok(cycle);
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(set(args))
    }

    async fn set(args: Args) -> Result<(), Error> {
        let setpoint = args.setpoint;
        let connection = Arc::new(Connection::new(args.connection.clone()));
        let link = RegisterLink::new(connection, args.connection.register_kind());
        let running = PollLoop::new(ChunkedPoller::new(link), &args.poller).spawn();
        let mut cycles = running.cycles.clone();
        let first = next_cycle(&mut cycles).await?;

        let automaton = HmiAutomaton::from_args(&args.hmi);
        let refresh = Some(running.refresh.clone());
        let controller = SetpointController::new(automaton, &args.controller, refresh);
        controller.update_from_snapshot(&first.snapshot);
        let adjustment = controller
            .request_setpoint(setpoint, args.value)
            .await
            .map_err(|e| Error::Setpoint(setpoint, e))?;
        let expected = match adjustment {
            Adjustment::Unchanged { value } => {
                info!(message = "setpoint is already at the requested value", %setpoint, value);
                return Ok(());
            }
            Adjustment::Adjusted { from, to, clicks } => {
                info!(message = "setpoint adjusted", %setpoint, from, to, clicks);
                to
            }
        };
        if args.no_verify {
            return Ok(());
        }

        let propagation_delay = args.controller.propagation_delay();
        let adjusted_at = Instant::now();
        info!(message = "waiting for the device to report the new setpoint", ?propagation_delay);
        let cycle = loop {
            let cycle = next_cycle(&mut cycles).await?;
            if adjusted_at.elapsed() >= propagation_delay {
                break cycle;
            }
        };
        controller.update_from_snapshot(&cycle.snapshot);
        match controller.current(setpoint) {
            Some(found) if (found - expected).abs() < controller.step() / 2.0 => {
                info!(message = "setpoint confirmed", %setpoint, value = found);
                Ok(())
            }
            found => {
                warn!(message = "setpoint did not change as requested", %setpoint, ?found);
                Err(Error::NotApplied { setpoint, expected, found })
            }
        }
    }
}

pub mod click {
    use crate::hmi::{self, AdjustError, HmiAutomaton, Point};

    /// Tap a single screen coordinate of the HMI.
    ///
    /// Useful to find out where the buttons of a differently laid out panel are.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        hmi: hmi::Args,
        x: u16,
        y: u16,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not tap ({0}, {1})")]
        Tap(u16, u16, #[source] AdjustError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let point = Point { x: args.x, y: args.y };
        HmiAutomaton::from_args(&args.hmi)
            .tap_blocking(point)
            .map_err(|e| Error::Tap(args.x, args.y, e))
    }
}
