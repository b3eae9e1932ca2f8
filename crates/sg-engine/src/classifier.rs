//! Load classification and the input rate table

use sg_common::SystemState;
use sg_config::AdmissionConfig;

/// Maps backlog depth to a `SystemState`, and a state to its admission rate.
///
/// The four depth ranges are half-open and contiguous:
/// `[0, busy)`, `[busy, overloaded)`, `[overloaded, critical)`, `[critical, inf)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    busy_threshold: u64,
    overloaded_threshold: u64,
    critical_threshold: u64,
    normal_rps: u32,
    busy_rps: u32,
    overloaded_rps: u32,
    critical_rps: u32,
}

impl Classifier {
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            busy_threshold: config.busy_threshold,
            overloaded_threshold: config.overloaded_threshold,
            critical_threshold: config.critical_threshold,
            normal_rps: config.normal_rps,
            busy_rps: config.busy_rps,
            overloaded_rps: config.overloaded_rps,
            critical_rps: config.critical_rps,
        }
    }

    pub fn classify(&self, depth: u64) -> SystemState {
        if depth >= self.critical_threshold {
            SystemState::Critical
        } else if depth >= self.overloaded_threshold {
            SystemState::Overloaded
        } else if depth >= self.busy_threshold {
            SystemState::Busy
        } else {
            SystemState::Normal
        }
    }

    /// Admissions allowed per window while in `state`
    pub fn rate_for_state(&self, state: SystemState) -> u32 {
        match state {
            SystemState::Normal => self.normal_rps,
            SystemState::Busy => self.busy_rps,
            SystemState::Overloaded => self.overloaded_rps,
            SystemState::Critical => self.critical_rps,
        }
    }

    /// Allowed rate for a given depth
    pub fn limit_for_depth(&self, depth: u64) -> (SystemState, u32) {
        let state = self.classify(depth);
        (state, self.rate_for_state(state))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }
}
