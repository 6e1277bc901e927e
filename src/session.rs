//! Session state machine and stop-condition policy.
//!
//! ```text
//!            start            pause
//!   Idle ───────────► Running ◄──────► Paused
//!     ▲                  │     resume     │
//!     │ reset            │ stop           │ stop
//!     │                  ▼                ▼
//!     └──────────── Stopping ───────► Stopped ──► (start) Running
//! ```
//!
//! Elapsed running time excludes every pause interval, so limits are
//! measured against time the animal actually spent in the task.
//!
//! Nothing here performs I/O; the controller sends the matching commands to
//! the rig and calls into this module under its session lock.

use crate::error::{AppResult, RigError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Policy selecting which stop condition(s) govern a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitKind {
    /// Stop once running time reaches the time limit
    Time,
    /// Stop after the infusion limit plus the stop delay
    Infusion,
    /// Whichever of the two comes first
    Both,
    /// Never stop on its own
    #[default]
    Unset,
}

impl FromStr for LimitKind {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "time" => Ok(LimitKind::Time),
            "infusion" => Ok(LimitKind::Infusion),
            "both" => Ok(LimitKind::Both),
            _ => Err(RigError::InvalidLimitKind(s.to_string())),
        }
    }
}

/// Stop conditions, set before the session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionLimits {
    /// Which conditions apply
    pub kind: LimitKind,
    /// Pump infusions that trigger the stop delay
    pub infusion_limit: Option<u32>,
    /// Maximum running time, net of pauses
    pub time_limit: Option<Duration>,
    /// Grace period after the infusion limit is reached
    pub stop_delay: Option<Duration>,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No session since start-up or reset
    Idle,
    /// Collecting telemetry with the clock running
    Running,
    /// Clock stopped, session still open
    Paused,
    /// Teardown claimed by one caller
    Stopping,
    /// Ended; a new session may start
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Running => "running",
            SessionPhase::Paused => "paused",
            SessionPhase::Stopping => "stopping",
            SessionPhase::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Why the limit monitor ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Running time reached the time limit
    TimeLimit,
    /// Stop delay after the infusion limit elapsed
    InfusionLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TimeLimit => f.write_str("time limit reached"),
            StopReason::InfusionLimit => f.write_str("infusion limit reached and stop delay elapsed"),
        }
    }
}

/// Outcome of one limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    /// Keep running
    Continue,
    /// End the session
    Stop(StopReason),
}

/// Session timing.
///
/// Monotonic instants drive limit accounting; wall-clock instants are only
/// recorded for reporting.
#[derive(Debug, Clone, Default)]
pub struct SessionClock {
    start_time: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    paused_accum: Duration,
    pause_started_at: Option<Instant>,
    last_infusion_time: Option<Instant>,
}

impl SessionClock {
    /// Running time net of pauses, including a pause still in progress.
    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(start) = self.start_time else {
            return Duration::ZERO;
        };
        let ongoing_pause = self
            .pause_started_at
            .map(|p| now.saturating_duration_since(p))
            .unwrap_or_default();
        now.saturating_duration_since(start)
            .saturating_sub(self.paused_accum)
            .saturating_sub(ongoing_pause)
    }

    /// Total length of finished pauses.
    pub fn paused_total(&self) -> Duration {
        self.paused_accum
    }

    /// Wall-clock start.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Wall-clock end, once stopped.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// When the infusion limit was first reached this session.
    pub fn infusion_latched_at(&self) -> Option<Instant> {
        self.last_infusion_time
    }

    fn close_pause(&mut self, now: Instant) {
        if let Some(paused_at) = self.pause_started_at.take() {
            self.paused_accum += now.saturating_duration_since(paused_at);
        }
    }
}

/// Phase, clock and limits of the current session.
#[derive(Debug, Clone)]
pub struct Session {
    phase: SessionPhase,
    clock: SessionClock,
    limits: SessionLimits,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            clock: SessionClock::default(),
            limits: SessionLimits::default(),
        }
    }
}

impl Session {
    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// `true` only in [`SessionPhase::Running`].
    pub fn is_running(&self) -> bool {
        self.phase == SessionPhase::Running
    }

    /// Timing of the current or latest session.
    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    /// Configured stop conditions.
    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Replace the stop conditions.
    pub fn set_limits(&mut self, limits: SessionLimits) {
        self.limits = limits;
    }

    /// Fail unless a new session may start from the current phase.
    pub fn ensure_can_start(&self) -> AppResult<()> {
        match self.phase {
            SessionPhase::Idle | SessionPhase::Stopped => Ok(()),
            phase => Err(RigError::InvalidTransition {
                operation: "start",
                phase,
            }),
        }
    }

    /// Enter `Running` with a fresh clock.
    pub fn start(&mut self, now: Instant, wall: DateTime<Utc>) -> AppResult<()> {
        self.ensure_can_start()?;
        self.clock = SessionClock {
            start_time: Some(now),
            started_at: Some(wall),
            ..SessionClock::default()
        };
        self.phase = SessionPhase::Running;
        Ok(())
    }

    /// Running to Paused.
    pub fn pause(&mut self, now: Instant) -> AppResult<()> {
        if self.phase != SessionPhase::Running {
            return Err(RigError::InvalidTransition {
                operation: "pause",
                phase: self.phase,
            });
        }
        self.clock.pause_started_at = Some(now);
        self.phase = SessionPhase::Paused;
        Ok(())
    }

    /// Paused to Running, adding the pause to the paused total.
    pub fn resume(&mut self, now: Instant) -> AppResult<()> {
        if self.phase != SessionPhase::Paused {
            return Err(RigError::InvalidTransition {
                operation: "resume",
                phase: self.phase,
            });
        }
        self.clock.close_pause(now);
        self.phase = SessionPhase::Running;
        Ok(())
    }

    /// Claim the teardown. Returns `false` if there is nothing to stop or
    /// another caller is already stopping.
    pub fn begin_stop(&mut self, now: Instant) -> bool {
        match self.phase {
            SessionPhase::Running | SessionPhase::Paused => {
                self.clock.close_pause(now);
                self.phase = SessionPhase::Stopping;
                true
            }
            _ => false,
        }
    }

    /// Record the end time and enter [`SessionPhase::Stopped`].
    pub fn finish_stop(&mut self, wall: DateTime<Utc>) {
        self.clock.ended_at = Some(wall);
        self.phase = SessionPhase::Stopped;
    }

    /// Evaluate the stop conditions at `now`.
    ///
    /// The infusion latch is set the first time the count reaches the limit
    /// and is never moved afterwards within a session.
    pub fn check_limits(&mut self, now: Instant, infusion_count: usize) -> LimitDecision {
        if self.phase != SessionPhase::Running {
            return LimitDecision::Continue;
        }

        let time_met = self
            .limits
            .time_limit
            .is_some_and(|limit| self.clock.elapsed(now) >= limit);

        let infusion_met = match self.limits.kind {
            LimitKind::Infusion | LimitKind::Both => self.infusion_delay_met(now, infusion_count),
            LimitKind::Time | LimitKind::Unset => false,
        };

        match self.limits.kind {
            LimitKind::Time if time_met => LimitDecision::Stop(StopReason::TimeLimit),
            LimitKind::Infusion if infusion_met => LimitDecision::Stop(StopReason::InfusionLimit),
            LimitKind::Both if infusion_met => LimitDecision::Stop(StopReason::InfusionLimit),
            LimitKind::Both if time_met => LimitDecision::Stop(StopReason::TimeLimit),
            _ => LimitDecision::Continue,
        }
    }

    fn infusion_delay_met(&mut self, now: Instant, infusion_count: usize) -> bool {
        let Some(limit) = self.limits.infusion_limit else {
            return false;
        };
        if self.clock.last_infusion_time.is_none() && infusion_count >= limit as usize {
            tracing::info!(infusion_count, limit, "Infusion limit reached, stop delay started");
            self.clock.last_infusion_time = Some(now);
        }
        let delay = self.limits.stop_delay.unwrap_or_default();
        self.clock
            .last_infusion_time
            .is_some_and(|latched| now.saturating_duration_since(latched) >= delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn running(limits: SessionLimits, t0: Instant) -> Session {
        let mut session = Session::default();
        session.set_limits(limits);
        session.start(t0, Utc::now()).unwrap();
        session
    }

    #[test]
    fn limit_kind_parsing() {
        assert_eq!("Time".parse::<LimitKind>().unwrap(), LimitKind::Time);
        assert_eq!("infusion".parse::<LimitKind>().unwrap(), LimitKind::Infusion);
        assert_eq!("BOTH".parse::<LimitKind>().unwrap(), LimitKind::Both);
        assert!(matches!(
            "Forever".parse::<LimitKind>(),
            Err(RigError::InvalidLimitKind(kind)) if kind == "Forever"
        ));
    }

    #[test]
    fn pause_accounting_excludes_pause_interval() {
        let t0 = Instant::now();
        let mut session = running(SessionLimits::default(), t0);

        session.pause(t0 + secs(10)).unwrap();
        assert_eq!(session.clock().elapsed(t0 + secs(12)), secs(10));
        session.resume(t0 + secs(15)).unwrap();

        assert_eq!(session.clock().elapsed(t0 + secs(20)), secs(15));
        assert_eq!(session.clock().paused_total(), secs(5));
    }

    #[test]
    fn repeated_pauses_accumulate() {
        let t0 = Instant::now();
        let mut session = running(SessionLimits::default(), t0);

        session.pause(t0 + secs(1)).unwrap();
        session.resume(t0 + secs(3)).unwrap();
        session.pause(t0 + secs(4)).unwrap();
        session.resume(t0 + secs(7)).unwrap();

        assert_eq!(session.clock().paused_total(), secs(5));
        assert_eq!(session.clock().elapsed(t0 + secs(10)), secs(5));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let t0 = Instant::now();
        let mut session = Session::default();
        assert!(matches!(
            session.pause(t0),
            Err(RigError::InvalidTransition { operation: "pause", phase: SessionPhase::Idle })
        ));
        assert!(session.resume(t0).is_err());

        session.start(t0, Utc::now()).unwrap();
        assert!(session.start(t0, Utc::now()).is_err());
        session.pause(t0).unwrap();
        assert!(session.pause(t0).is_err());
        assert_eq!(session.phase(), SessionPhase::Paused);
    }

    #[test]
    fn stop_is_claimed_once() {
        let t0 = Instant::now();
        let mut session = running(SessionLimits::default(), t0);
        assert!(session.begin_stop(t0 + secs(1)));
        assert!(!session.begin_stop(t0 + secs(1)));
        session.finish_stop(Utc::now());
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(session.clock().ended_at().is_some());
        assert!(!session.begin_stop(t0 + secs(2)));

        // Stopped sessions may start again
        session.start(t0 + secs(3), Utc::now()).unwrap();
        assert!(session.is_running());
        assert_eq!(session.clock().ended_at(), None);
    }

    #[test]
    fn time_limit_fires_at_threshold() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            kind: LimitKind::Time,
            time_limit: Some(secs(5)),
            ..Default::default()
        };
        let mut session = running(limits, t0);
        assert_eq!(session.check_limits(t0 + secs(4), 0), LimitDecision::Continue);
        assert_eq!(
            session.check_limits(t0 + secs(5), 0),
            LimitDecision::Stop(StopReason::TimeLimit)
        );
    }

    #[test]
    fn time_limit_ignores_paused_time() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            kind: LimitKind::Time,
            time_limit: Some(secs(5)),
            ..Default::default()
        };
        let mut session = running(limits, t0);
        session.pause(t0 + secs(2)).unwrap();
        assert_eq!(session.check_limits(t0 + secs(6), 0), LimitDecision::Continue);
        session.resume(t0 + secs(8)).unwrap();
        assert_eq!(session.check_limits(t0 + secs(10), 0), LimitDecision::Continue);
        assert_eq!(
            session.check_limits(t0 + secs(11), 0),
            LimitDecision::Stop(StopReason::TimeLimit)
        );
    }

    #[test]
    fn infusion_limit_latches_then_waits_for_delay() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            kind: LimitKind::Infusion,
            infusion_limit: Some(2),
            stop_delay: Some(secs(3)),
            ..Default::default()
        };
        let mut session = running(limits, t0);

        assert_eq!(session.check_limits(t0 + secs(1), 1), LimitDecision::Continue);
        assert_eq!(session.check_limits(t0 + secs(2), 2), LimitDecision::Continue);
        assert_eq!(session.clock().infusion_latched_at(), Some(t0 + secs(2)));

        // More infusions do not move the latch
        assert_eq!(session.check_limits(t0 + secs(4), 3), LimitDecision::Continue);
        assert_eq!(session.clock().infusion_latched_at(), Some(t0 + secs(2)));

        assert_eq!(
            session.check_limits(t0 + secs(5), 3),
            LimitDecision::Stop(StopReason::InfusionLimit)
        );
    }

    #[test]
    fn both_stops_on_whichever_comes_first() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            kind: LimitKind::Both,
            time_limit: Some(secs(100)),
            infusion_limit: Some(1),
            stop_delay: Some(Duration::ZERO),
        };
        let mut session = running(limits.clone(), t0);
        assert_eq!(
            session.check_limits(t0 + secs(1), 1),
            LimitDecision::Stop(StopReason::InfusionLimit)
        );

        let mut session = running(limits, t0);
        assert_eq!(session.check_limits(t0 + secs(50), 0), LimitDecision::Continue);
        assert_eq!(
            session.check_limits(t0 + secs(100), 0),
            LimitDecision::Stop(StopReason::TimeLimit)
        );
    }

    #[test]
    fn missing_values_never_fire() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            kind: LimitKind::Time,
            ..Default::default()
        };
        let mut session = running(limits, t0);
        assert_eq!(session.check_limits(t0 + secs(10_000), 50), LimitDecision::Continue);

        let mut session = running(SessionLimits::default(), t0);
        assert_eq!(session.check_limits(t0 + secs(10_000), 50), LimitDecision::Continue);
    }

    #[test]
    fn paused_session_is_not_checked() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            kind: LimitKind::Time,
            time_limit: Some(secs(1)),
            ..Default::default()
        };
        let mut session = running(limits, t0);
        session.pause(t0).unwrap();
        assert_eq!(session.check_limits(t0 + secs(30), 0), LimitDecision::Continue);
    }
}
