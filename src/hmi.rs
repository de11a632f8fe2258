//! Adjusting setpoints by tapping through the heat pump's touchscreen.
//!
//! The controller offers no writable setpoint registers, so a setpoint is changed the way a person
//! would: go to the home screen, open the manual setting dialog and press `+` or `-` once per
//! step. The sequence is open loop; nothing checks that the screen is where we expect it to be.

use crate::rfb::{self, DisplayLink};
use std::time::Duration;
use tracing::{debug, info};

#[derive(clap::Parser, Clone)]
#[group(id = "hmi::Args")]
pub struct Args {
    /// Host name or IP address of the touchscreen HMI's VNC server.
    #[arg(long)]
    hmi: String,

    #[arg(long, default_value = "5900")]
    hmi_port: u16,

    /// VNC password of the HMI. Only the first 8 bytes are significant.
    #[arg(long, env = "KITA_HMI_PASSWORD", default_value = "111111", hide_env_values = true)]
    hmi_password: String,

    /// Timeout for connecting to the HMI and for every individual read or write.
    #[arg(long, default_value = "10s")]
    hmi_timeout: humantime::Duration,

    /// How long to wait for more unsolicited data when discarding it.
    #[arg(long, default_value = "300ms")]
    drain_timeout: humantime::Duration,

    /// Pause between the move, press and release events making up a single tap.
    #[arg(long, default_value = "20ms")]
    pointer_event_gap: humantime::Duration,

    /// Time the HMI is given to switch screens after a navigation tap.
    #[arg(long, default_value = "1500ms")]
    transition_delay: humantime::Duration,

    /// Pause after each `+`/`-` press.
    #[arg(long, default_value = "350ms")]
    repeat_delay: humantime::Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum AdjustError {
    #[error("the HMI session failed")]
    Session(#[source] rfb::Error),
    #[error("the HMI worker thread did not finish")]
    Worker(#[source] tokio::task::JoinError),
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum Setpoint {
    /// Heating (winter) water temperature.
    Winter,
    /// Domestic hot water temperature.
    Dhw,
    /// Cooling (summer) water temperature.
    Summer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClickTarget {
    pub setpoint: Setpoint,
    pub direction: Direction,
}

impl ClickTarget {
    /// The button to press for a signed click count, `None` if there is nothing to press.
    pub fn for_clicks(setpoint: Setpoint, clicks: i32) -> Option<Self> {
        let direction = match clicks.signum() {
            0 => return None,
            1 => Direction::Increase,
            _ => Direction::Decrease,
        };
        Some(Self { setpoint, direction })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: u16,
    pub y: u16,
}

const fn pt(x: u16, y: u16) -> Point {
    Point { x, y }
}

/// Where things are on the HMI screens.
#[derive(Clone, Debug)]
pub struct ScreenLayout {
    pub home: Point,
    /// Opens the manual setting dialog from the home screen.
    pub manual_setting: Point,
    /// `[increase, decrease]` for winter, dhw and summer in that order.
    buttons: [[Point; 2]; 3],
}

impl ScreenLayout {
    /// The 800x480 Weintek panel shipped with the Kita.
    pub const KITA_800X480: ScreenLayout = ScreenLayout {
        home: pt(180, 45),
        manual_setting: pt(85, 280),
        buttons: [
            [pt(265, 205), pt(265, 340)],
            [pt(400, 205), pt(400, 340)],
            [pt(535, 205), pt(535, 340)],
        ],
    };

    pub fn button(&self, target: ClickTarget) -> Point {
        let row = match target.setpoint {
            Setpoint::Winter => 0,
            Setpoint::Dhw => 1,
            Setpoint::Summer => 2,
        };
        let column = match target.direction {
            Direction::Increase => 0,
            Direction::Decrease => 1,
        };
        self.buttons[row][column]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Timing {
    /// Wait after navigation taps.
    pub transition: Duration,
    /// Wait after each `+`/`-` press.
    pub repeat: Duration,
}

/// Carries out a setpoint change of `clicks` steps (negative to decrease).
pub trait Automaton: Send + Sync {
    fn adjust(
        &self,
        setpoint: Setpoint,
        clicks: i32,
    ) -> impl Future<Output = Result<(), AdjustError>> + Send;
}

#[derive(Clone)]
pub struct HmiAutomaton {
    config: rfb::Config,
    layout: ScreenLayout,
    timing: Timing,
}

impl HmiAutomaton {
    pub fn new(config: rfb::Config, layout: ScreenLayout, timing: Timing) -> Self {
        Self { config, layout, timing }
    }

    pub fn from_args(args: &Args) -> Self {
        let config = rfb::Config {
            address: format!("{}:{}", args.hmi, args.hmi_port),
            password: args.hmi_password.clone(),
            timeout: *args.hmi_timeout,
            drain_timeout: *args.drain_timeout,
            pointer_event_gap: *args.pointer_event_gap,
        };
        let timing = Timing { transition: *args.transition_delay, repeat: *args.repeat_delay };
        Self::new(config, ScreenLayout::KITA_800X480, timing)
    }

    /// Run the whole tap sequence on the calling thread.
    ///
    /// The HMI session is closed before this returns, whether the sequence succeeded or not.
    pub fn adjust_blocking(&self, setpoint: Setpoint, clicks: i32) -> Result<(), AdjustError> {
        self.adjust_on(&mut DisplayLink::new(self.config.clone()), setpoint, clicks)
    }

    /// [`HmiAutomaton::adjust_blocking`] over a caller provided `link`, left disconnected on
    /// return.
    pub fn adjust_on(
        &self,
        link: &mut DisplayLink,
        setpoint: Setpoint,
        clicks: i32,
    ) -> Result<(), AdjustError> {
        let Some(target) = ClickTarget::for_clicks(setpoint, clicks) else {
            return Ok(());
        };
        let button = self.layout.button(target);
        let presses = clicks.unsigned_abs();
        info!(
            message = "adjusting setpoint via the HMI",
            %setpoint,
            direction = ?target.direction,
            presses
        );
        session(link, |link| {
            link.click(self.layout.home.x, self.layout.home.y, self.timing.transition)?;
            link.drain()?;
            let dialog = self.layout.manual_setting;
            link.click(dialog.x, dialog.y, self.timing.transition)?;
            link.drain()?;
            for press in 0..presses {
                debug!(message = "press", press, x = button.x, y = button.y);
                link.click(button.x, button.y, self.timing.repeat)?;
            }
            link.drain()
        })
    }

    /// Open a session, tap `point` once and close the session again.
    pub fn tap_blocking(&self, point: Point) -> Result<(), AdjustError> {
        session(&mut DisplayLink::new(self.config.clone()), |link| {
            link.click(point.x, point.y, self.timing.transition)?;
            link.drain()
        })
    }
}

/// Bring `link` up, run `f` on it and close it again, also when any step fails.
fn session(
    link: &mut DisplayLink,
    f: impl FnOnce(&mut DisplayLink) -> Result<(), rfb::Error>,
) -> Result<(), AdjustError> {
    let result = link.connect().and_then(|()| link.finish_handshake()).and_then(|()| f(&mut *link));
    link.close();
    result.map_err(AdjustError::Session)
}

impl Automaton for HmiAutomaton {
    async fn adjust(&self, setpoint: Setpoint, clicks: i32) -> Result<(), AdjustError> {
        if clicks == 0 {
            return Ok(());
        }
        let automaton = self.clone();
        tokio::task::spawn_blocking(move || automaton.adjust_blocking(setpoint, clicks))
            .await
            .map_err(AdjustError::Worker)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::tests::{serve_one_session, serve_then_hang_up, test_config};

    fn automaton(address: String, password: &str) -> HmiAutomaton {
        let timing = Timing { transition: Duration::ZERO, repeat: Duration::ZERO };
        HmiAutomaton::new(test_config(address, password), ScreenLayout::KITA_800X480, timing)
    }

    fn presses(events: &[(u8, u16, u16)]) -> Vec<(u16, u16)> {
        events.iter().filter(|(buttons, _, _)| *buttons != 0).map(|(_, x, y)| (*x, *y)).collect()
    }

    #[test]
    fn buttons_resolve_per_target_and_direction() {
        let layout = ScreenLayout::KITA_800X480;
        let target = |setpoint, clicks| ClickTarget::for_clicks(setpoint, clicks).unwrap();
        assert_eq!(layout.button(target(Setpoint::Winter, 1)), pt(265, 205));
        assert_eq!(layout.button(target(Setpoint::Winter, -1)), pt(265, 340));
        assert_eq!(layout.button(target(Setpoint::Dhw, 7)), pt(400, 205));
        assert_eq!(layout.button(target(Setpoint::Summer, -40)), pt(535, 340));
        assert_eq!(ClickTarget::for_clicks(Setpoint::Dhw, 0), None);
    }

    #[test]
    fn setpoint_names() {
        assert_eq!(Setpoint::Dhw.to_string(), "dhw");
        assert_eq!("winter".parse::<Setpoint>().unwrap(), Setpoint::Winter);
    }

    #[test]
    fn navigates_then_presses_increase() {
        let (address, server) = serve_one_session("111111");
        automaton(address, "111111").adjust_blocking(Setpoint::Dhw, 3).unwrap();
        let log = server.join().unwrap();
        assert_eq!(log.pointer_events.len(), 5 * 3);
        assert_eq!(
            presses(&log.pointer_events),
            [(180, 45), (85, 280), (400, 205), (400, 205), (400, 205)]
        );
    }

    #[test]
    fn negative_clicks_press_decrease() {
        let (address, server) = serve_one_session("111111");
        automaton(address, "111111").adjust_blocking(Setpoint::Summer, -2).unwrap();
        let log = server.join().unwrap();
        assert_eq!(presses(&log.pointer_events), [(180, 45), (85, 280), (535, 340), (535, 340)]);
    }

    #[test]
    fn zero_clicks_never_connects() {
        // Nothing listens here; connecting would fail.
        let automaton = automaton("127.0.0.1:1".to_string(), "111111");
        automaton.adjust_blocking(Setpoint::Winter, 0).unwrap();
    }

    #[test]
    fn rejected_password_aborts_before_any_tap() {
        let (address, server) = serve_one_session("111111");
        let error = automaton(address, "000000").adjust_blocking(Setpoint::Winter, 4).unwrap_err();
        assert!(matches!(error, AdjustError::Session(rfb::Error::AuthenticationFailed(_))));
        let log = server.join().unwrap();
        assert!(!log.authenticated);
        assert!(log.pointer_events.is_empty());
    }

    #[test]
    fn lost_connection_mid_sequence_closes_the_link() {
        let (address, server) = serve_then_hang_up("111111");
        let mut hmi = automaton(address, "111111");
        let pause = Duration::from_millis(10);
        hmi.timing = Timing { transition: pause, repeat: pause };
        let mut link = DisplayLink::new(hmi.config.clone());
        let error = hmi.adjust_on(&mut link, Setpoint::Dhw, 5).unwrap_err();
        assert!(matches!(error, AdjustError::Session(rfb::Error::PointerEvent(_))));
        assert_eq!(link.state(), rfb::State::Disconnected);
        assert!(matches!(link.click(1, 1, Duration::ZERO), Err(rfb::Error::NotConnected)));
        assert!(server.join().unwrap().authenticated);
    }

    #[tokio::test]
    async fn async_adjust_runs_on_blocking_worker() {
        let (address, server) = serve_one_session("111111");
        automaton(address, "111111").adjust(Setpoint::Winter, 1).await.unwrap();
        let log = tokio::task::spawn_blocking(move || server.join().unwrap()).await.unwrap();
        assert_eq!(presses(&log.pointer_events), [(180, 45), (85, 280), (265, 205)]);
    }
}
