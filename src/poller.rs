use crate::register_link::{RegisterLink, Transport};
use crate::modbus::MAX_READ_COUNT;
use crate::registers::RegisterValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

#[derive(clap::Parser, Clone)]
#[group(id = "poller::Args")]
pub struct Args {
    /// An inclusive register address range to read every cycle (`FROM-TO` or a single `ADDR`).
    ///
    /// May be specified multiple times. Ranges are read independently of each other.
    #[arg(long = "range", value_name = "FROM-TO", default_values = ["2-18", "65-73", "234"])]
    ranges: Vec<RegisterRange>,

    /// Largest number of registers requested with a single read.
    ///
    /// A failed read only makes the registers of its own chunk unavailable.
    #[arg(long, default_value = "32", value_parser = clap::value_parser!(u16).range(1..=i64::from(MAX_READ_COUNT)))]
    chunk_size: u16,

    /// How often to read out the device.
    #[arg(long, default_value = "30s")]
    poll_period: humantime::Duration,
}

impl Args {
    pub fn ranges(&self) -> &[RegisterRange] {
        &self.ranges
    }

    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    pub fn poll_period(&self) -> Duration {
        *self.poll_period
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RangeParseError {
    #[error("`{0}` is not a register address")]
    Address(String, #[source] std::num::ParseIntError),
    #[error("range {0}-{1} ends before it starts")]
    Reversed(u16, u16),
}

/// An inclusive range of register addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRange {
    pub from: u16,
    pub to: u16,
}

impl RegisterRange {
    pub fn new(from: u16, to: u16) -> Result<Self, RangeParseError> {
        if from > to {
            return Err(RangeParseError::Reversed(from, to));
        }
        Ok(Self { from, to })
    }

    pub fn count(&self) -> u32 {
        u32::from(self.to) - u32::from(self.from) + 1
    }

    /// Split the range into consecutive sub-ranges of at most `chunk_size` registers.
    pub fn chunks(&self, chunk_size: u16) -> impl Iterator<Item = RegisterRange> + use<> {
        let step = u32::from(chunk_size.max(1));
        let (from, to) = (u32::from(self.from), u32::from(self.to));
        (from..=to).step_by(step as usize).map(move |start| {
            let end = (start + step - 1).min(to);
            // Both ends are bounded by `to`, which came from a `u16`.
            RegisterRange { from: start as u16, to: end as u16 }
        })
    }
}

impl std::str::FromStr for RegisterRange {
    type Err = RangeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            let v = v.trim();
            v.parse::<u16>().map_err(|e| RangeParseError::Address(v.to_string(), e))
        };
        match s.split_once('-') {
            None => {
                let address = parse(s)?;
                Self::new(address, address)
            }
            Some((from, to)) => Self::new(parse(from)?, parse(to)?),
        }
    }
}

impl std::fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// Every configured register address mapped to what the last poll cycle saw there.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    values: BTreeMap<u16, RegisterValue>,
}

impl Snapshot {
    pub fn get(&self, address: u16) -> Option<RegisterValue> {
        self.values.get(&address).copied()
    }

    /// The raw word at `address`, if it was both configured and read successfully.
    pub fn raw(&self, address: u16) -> Option<u16> {
        self.get(address).and_then(RegisterValue::raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, RegisterValue)> + '_ {
        self.values.iter().map(|(a, v)| (*a, *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(u16, RegisterValue)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (u16, RegisterValue)>>(iter: I) -> Self {
        Self { values: iter.into_iter().collect() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub elapsed: Duration,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub failed_registers: usize,
}

impl PollStats {
    /// Report the cycle, as a warning if any chunk failed.
    pub fn log(&self, sequence: u64, registers: usize) {
        if self.failed_chunks == 0 {
            info!(message = "poll cycle complete", sequence, registers, elapsed = ?self.elapsed);
        } else {
            warn!(
                message = "poll cycle complete with failures",
                sequence,
                registers,
                failed_chunks = self.failed_chunks,
                failed_registers = self.failed_registers,
                elapsed = ?self.elapsed
            );
        }
    }
}

pub struct ChunkedPoller<T> {
    link: RegisterLink<T>,
}

impl<T: Transport> ChunkedPoller<T> {
    pub fn new(link: RegisterLink<T>) -> Self {
        Self { link }
    }

    /// Read all of `ranges` in chunks of at most `chunk_size` registers.
    ///
    /// Never fails: a chunk that cannot be read makes each of its registers
    /// [`RegisterValue::Unavailable`] and the remaining chunks are still read.
    pub async fn poll(&self, ranges: &[RegisterRange], chunk_size: u16) -> (Snapshot, PollStats) {
        let started = Instant::now();
        let mut snapshot = Snapshot::default();
        let mut stats = PollStats::default();
        for range in ranges {
            for chunk in range.chunks(chunk_size) {
                stats.chunks += 1;
                // `chunks` never yields more than `chunk_size` addresses.
                let count = chunk.count() as u16;
                match self.link.read(chunk.from, count).await {
                    Ok(values) => {
                        snapshot.values.extend((chunk.from..=chunk.to).zip(values));
                    }
                    Err(e) => {
                        debug!(
                            message = "chunk could not be read",
                            from = chunk.from,
                            to = chunk.to,
                            error = (&e as &dyn std::error::Error)
                        );
                        stats.failed_chunks += 1;
                        stats.failed_registers += usize::from(count);
                        let unavailable = (chunk.from..=chunk.to).map(|a| (a, RegisterValue::Unavailable));
                        snapshot.values.extend(unavailable);
                    }
                }
            }
        }
        stats.elapsed = started.elapsed();
        (snapshot, stats)
    }
}

/// The outcome of one poll cycle as published by [`PollLoop`].
#[derive(Debug)]
pub struct Cycle {
    /// Counts up from 1 with every completed cycle.
    pub sequence: u64,
    pub snapshot: Snapshot,
    pub stats: PollStats,
}

/// Asks a running [`PollLoop`] to read the device out again without waiting for the period.
#[derive(Clone)]
pub struct RefreshHandle(Arc<Notify>);

impl RefreshHandle {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self(notify)
    }

    pub fn request(&self) {
        // Stores a permit if the loop is busy polling, so the request is never lost.
        self.0.notify_one();
    }
}

pub struct PollLoop<T> {
    poller: ChunkedPoller<T>,
    ranges: Vec<RegisterRange>,
    chunk_size: u16,
    period: Duration,
}

pub struct RunningPollLoop {
    pub cycles: watch::Receiver<Option<Arc<Cycle>>>,
    pub refresh: RefreshHandle,
    #[allow(unused)] // exists for its drop handler
    task: AbortOnDropHandle<()>,
}

impl<T: Transport + 'static> PollLoop<T> {
    pub fn new(poller: ChunkedPoller<T>, args: &Args) -> Self {
        Self {
            poller,
            ranges: args.ranges.clone(),
            chunk_size: args.chunk_size,
            period: *args.poll_period,
        }
    }

    /// Start polling at a fixed period. Cycles never overlap.
    ///
    /// The loop stops when the returned value, and with it every receiver, is dropped.
    pub fn spawn(self) -> RunningPollLoop {
        let (sender, cycles) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let refresh = RefreshHandle::new(Arc::clone(&notify));
        let task = AbortOnDropHandle::new(tokio::spawn(self.main_loop(sender, notify)));
        RunningPollLoop { cycles, refresh, task }
    }

    async fn main_loop(self, sender: watch::Sender<Option<Arc<Cycle>>>, refresh: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = refresh.notified() => {
                    debug!("refresh requested");
                    interval.reset();
                },
            }
            let (snapshot, stats) = self.poller.poll(&self.ranges, self.chunk_size).await;
            sequence += 1;
            stats.log(sequence, snapshot.len());
            let cycle = Cycle { sequence, snapshot, stats };
            if sender.send(Some(Arc::new(cycle))).is_err() {
                debug!("nobody is interested in snapshots anymore");
                return;
            }
        }
    }
}
