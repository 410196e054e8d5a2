//! Window lifecycle phases derived from time remaining.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use common::PhaseConfig;

use crate::windows::WindowKey;

/// Where a window sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// First minutes; fades allowed at full size.
    Opening,
    /// Middle of the window; no entries.
    DeadZone,
    /// Final minutes; fades allowed at reduced size, snipes begin.
    Closing,
    /// Last minute; force-exit only.
    Flat,
    /// Past end time; terminal.
    Resolution,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Opening => "OPENING",
            Phase::DeadZone => "DEAD_ZONE",
            Phase::Closing => "CLOSING",
            Phase::Flat => "FLAT",
            Phase::Resolution => "RESOLUTION",
        }
    }

    /// Detectors may only open positions in these phases.
    pub fn allows_entries(&self) -> bool {
        matches!(self, Phase::Opening | Phase::Closing)
    }

    /// Positions must be closed out immediately in these phases.
    pub fn forces_exit(&self) -> bool {
        matches!(self, Phase::Flat | Phase::Resolution)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OPENING" => Ok(Phase::Opening),
            "DEAD_ZONE" => Ok(Phase::DeadZone),
            "CLOSING" => Ok(Phase::Closing),
            "FLAT" => Ok(Phase::Flat),
            "RESOLUTION" => Ok(Phase::Resolution),
            other => Err(format!("unsupported phase: {other}")),
        }
    }
}

/// Classify a moment by seconds remaining until window end.
pub fn phase_for(seconds_remaining: i64, bounds: &PhaseConfig) -> Phase {
    if seconds_remaining <= 0 {
        Phase::Resolution
    } else if seconds_remaining <= bounds.closing_end_sec {
        Phase::Flat
    } else if seconds_remaining <= bounds.deadzone_end_sec {
        Phase::Closing
    } else if seconds_remaining <= bounds.opening_end_sec {
        Phase::DeadZone
    } else {
        Phase::Opening
    }
}

/// Classify a window at `now`.
pub fn phase_at(now: DateTime<Utc>, end_time: DateTime<Utc>, bounds: &PhaseConfig) -> Phase {
    phase_for((end_time - now).num_seconds(), bounds)
}

/// Polling edge detector for phase transitions, one slot per window.
#[derive(Default)]
pub struct PhaseTracker {
    last: HashMap<WindowKey, Phase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the phase observed for a window; returns the transition edge
    /// `(previous, current)` when it changed since the last observation.
    pub fn observe(&mut self, key: WindowKey, current: Phase) -> Option<(Phase, Phase)> {
        match self.last.insert(key, current) {
            Some(previous) if previous != current => Some((previous, current)),
            _ => None,
        }
    }

    /// Drop slots for windows no longer tracked.
    pub fn retain(&mut self, live: &[WindowKey]) {
        self.last.retain(|key, _| live.contains(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::Asset;

    fn bounds() -> PhaseConfig {
        PhaseConfig::default()
    }

    #[test]
    fn test_phase_boundaries() {
        let b = bounds();
        // 15-minute window: 900s total
        assert_eq!(phase_for(900, &b), Phase::Opening);
        assert_eq!(phase_for(721, &b), Phase::Opening);
        assert_eq!(phase_for(720, &b), Phase::DeadZone);
        assert_eq!(phase_for(181, &b), Phase::DeadZone);
        assert_eq!(phase_for(180, &b), Phase::Closing);
        assert_eq!(phase_for(61, &b), Phase::Closing);
        assert_eq!(phase_for(60, &b), Phase::Flat);
        assert_eq!(phase_for(1, &b), Phase::Flat);
        assert_eq!(phase_for(0, &b), Phase::Resolution);
        assert_eq!(phase_for(-5, &b), Phase::Resolution);
    }

    #[test]
    fn test_entry_and_exit_rules() {
        assert!(Phase::Opening.allows_entries());
        assert!(Phase::Closing.allows_entries());
        assert!(!Phase::DeadZone.allows_entries());
        assert!(!Phase::Flat.allows_entries());

        assert!(Phase::Flat.forces_exit());
        assert!(Phase::Resolution.forces_exit());
        assert!(!Phase::Closing.forces_exit());
    }

    #[test]
    fn test_phase_tracker_edges() {
        let mut tracker = PhaseTracker::new();
        let key = WindowKey::new(Asset::Btc, 1_754_055_000);

        assert_eq!(tracker.observe(key, Phase::Opening), None);
        assert_eq!(tracker.observe(key, Phase::Opening), None);
        assert_eq!(
            tracker.observe(key, Phase::DeadZone),
            Some((Phase::Opening, Phase::DeadZone))
        );
        assert_eq!(tracker.observe(key, Phase::DeadZone), None);

        tracker.retain(&[]);
        // Slot cleared: next observation is treated as first
        assert_eq!(tracker.observe(key, Phase::Closing), None);
    }
}
