use crate::hmi::{AdjustError, Automaton, Setpoint};
use crate::poller::{RefreshHandle, Snapshot};
use crate::registers::{self, DataType};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(clap::Parser, Clone)]
#[group(id = "controller::Args")]
pub struct Args {
    /// How much a single `+`/`-` press changes a setpoint.
    ///
    /// Requested values are rounded to the nearest multiple of this.
    #[arg(long, default_value = "0.5", value_parser = parse_step)]
    step: f64,

    /// Refuse adjustments that would need more presses than this.
    #[arg(long, default_value = "40")]
    max_clicks: u16,

    /// How long the controller takes to expose a changed setpoint in its registers.
    ///
    /// The device is read out again once this has passed after an adjustment.
    #[arg(long, default_value = "35s")]
    propagation_delay: humantime::Duration,
}

impl Args {
    pub fn propagation_delay(&self) -> Duration {
        *self.propagation_delay
    }
}

fn parse_step(s: &str) -> Result<f64, String> {
    let step = s.parse::<f64>().map_err(|e| e.to_string())?;
    if !(step.is_finite() && step > 0.0) {
        return Err(format!("{step} is not a positive step"));
    }
    Ok(step)
}

#[derive(thiserror::Error, Debug)]
pub enum SetpointError {
    #[error("the current {0} setpoint is not known yet")]
    UnknownCurrentValue(Setpoint),
    #[error("{desired} is outside of the {min}..={max} range of the {setpoint} setpoint")]
    OutOfRange { setpoint: Setpoint, desired: f64, min: f64, max: f64 },
    #[error("reaching the requested value needs {clicks} presses, more than the {max} allowed")]
    TooManyClicks { clicks: u64, max: u16 },
    #[error("could not operate the HMI")]
    Automaton(#[source] AdjustError),
}

/// Where a setpoint can be read back and which values the controller accepts for it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Binding {
    pub register: u16,
    pub data_type: DataType,
    pub min: f64,
    pub max: f64,
}

pub fn binding(setpoint: Setpoint) -> Binding {
    let (register, min, max) = match setpoint {
        Setpoint::Winter => (registers::HEATING_SETPOINT, 20.0, 55.0),
        Setpoint::Dhw => (registers::HOT_WATER_SETPOINT, 30.0, 60.0),
        Setpoint::Summer => (registers::COOLING_SETPOINT, 5.0, 25.0),
    };
    Binding { register, data_type: DataType::CEL, min, max }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Adjustment {
    /// The requested value rounds to what the setpoint already is.
    Unchanged { value: f64 },
    Adjusted { from: f64, to: f64, clicks: i32 },
}

pub struct SetpointController<A> {
    automaton: A,
    /// Held for the whole duration of an HMI session.
    automation: tokio::sync::Mutex<()>,
    known: Mutex<HashMap<Setpoint, f64>>,
    step: f64,
    max_clicks: u16,
    propagation_delay: Duration,
    refresh: Option<RefreshHandle>,
}

impl<A: Automaton> SetpointController<A> {
    pub fn new(automaton: A, args: &Args, refresh: Option<RefreshHandle>) -> Self {
        Self {
            automaton,
            automation: tokio::sync::Mutex::new(()),
            known: Mutex::new(HashMap::new()),
            step: args.step,
            max_clicks: args.max_clicks,
            propagation_delay: *args.propagation_delay,
            refresh,
        }
    }

    /// Replace the known setpoint values with what `snapshot` contains.
    ///
    /// A setpoint whose register is missing or unavailable becomes unknown.
    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        for setpoint in <Setpoint as strum::IntoEnumIterator>::iter() {
            let binding = binding(setpoint);
            match snapshot.raw(binding.register) {
                Some(raw) => {
                    known.insert(setpoint, binding.data_type.decode(raw));
                }
                None => {
                    known.remove(&setpoint);
                }
            }
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn current(&self, setpoint: Setpoint) -> Option<f64> {
        let known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        known.get(&setpoint).copied()
    }

    /// Bring `setpoint` to `desired`, rounded to the nearest step, by pressing HMI buttons.
    ///
    /// Refusals happen before the HMI is touched. Only one HMI session runs at a time; concurrent
    /// requests wait for their turn and then plan their presses again from the value left behind
    /// by the sessions before them.
    pub async fn request_setpoint(
        &self,
        setpoint: Setpoint,
        desired: f64,
    ) -> Result<Adjustment, SetpointError> {
        self.current(setpoint).ok_or(SetpointError::UnknownCurrentValue(setpoint))?;
        let Binding { min, max, .. } = binding(setpoint);
        if !(min..=max).contains(&desired) {
            return Err(SetpointError::OutOfRange { setpoint, desired, min, max });
        }
        let target = (desired / self.step).round() * self.step;
        if let (current, 0) = self.plan(setpoint, target)? {
            debug!(message = "setpoint already at the requested value", %setpoint, current);
            return Ok(Adjustment::Unchanged { value: current });
        }

        let session = self.automation.lock().await;
        let (current, clicks) = self.plan(setpoint, target)?;
        if clicks == 0 {
            debug!(message = "an earlier session reached the requested value", %setpoint, current);
            return Ok(Adjustment::Unchanged { value: current });
        }
        info!(message = "adjusting setpoint", %setpoint, from = current, to = target, clicks);
        self.automaton.adjust(setpoint, clicks).await.map_err(SetpointError::Automaton)?;
        self.known.lock().unwrap_or_else(PoisonError::into_inner).insert(setpoint, target);
        drop(session);

        self.schedule_refresh();
        Ok(Adjustment::Adjusted { from: current, to: target, clicks })
    }

    /// The current value of `setpoint` and the signed presses needed to get it to `target`.
    fn plan(&self, setpoint: Setpoint, target: f64) -> Result<(f64, i32), SetpointError> {
        let current = self.current(setpoint).ok_or(SetpointError::UnknownCurrentValue(setpoint))?;
        let clicks = ((target - current) / self.step).round();
        if clicks.abs() > f64::from(self.max_clicks) {
            let clicks = clicks.abs() as u64;
            return Err(SetpointError::TooManyClicks { clicks, max: self.max_clicks });
        }
        // Bounded by `max_clicks` just above.
        Ok((current, clicks as i32))
    }

    fn schedule_refresh(&self) {
        let Some(refresh) = self.refresh.clone() else {
            return;
        };
        let delay = self.propagation_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("re-reading the device after a setpoint change");
            refresh.request();
        });
    }
}
