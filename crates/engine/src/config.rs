//! Engine configuration. Fixed for the lifetime of the process.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub columns: u32,
    pub rows: u32,
    /// Palette index the bots drift towards; `None` picks one at startup.
    pub target: Option<u8>,
    pub bots_enabled: bool,
    pub inertia: InertiaConfig,
    pub bots: BotTiming,
    pub subscriber: SubscriberTiming,
    /// Seed for tile seeding, reservations and bot jitter. Unset means OS entropy.
    pub seed: Option<u64>,
}

/// How the process-wide inertia decays and when bots may settle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InertiaConfig {
    pub initial: f64,
    pub floor: f64,
    pub step: f64,
    /// Bots sitting on the target stop for good once inertia is at or below this.
    pub convergence_threshold: f64,
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotTiming {
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub correct_multiplier: f64,
    pub wrong_multiplier: f64,
    pub arm_delay_min_ms: u64,
    pub arm_delay_spread_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberTiming {
    pub event_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            columns: 8,
            rows: 6,
            target: None,
            bots_enabled: true,
            inertia: InertiaConfig::default(),
            bots: BotTiming::default(),
            subscriber: SubscriberTiming::default(),
            seed: None,
        }
    }
}

impl Default for InertiaConfig {
    fn default() -> Self {
        Self {
            initial: 40.0,
            floor: 5.0,
            step: 1.0,
            convergence_threshold: 10.0,
            tick_ms: 1_000,
        }
    }
}

impl Default for BotTiming {
    fn default() -> Self {
        Self {
            jitter_min_ms: 0,
            jitter_max_ms: 1_000,
            correct_multiplier: 6.0,
            wrong_multiplier: 0.5,
            arm_delay_min_ms: 1_000,
            arm_delay_spread_ms: 10_000,
        }
    }
}

impl Default for SubscriberTiming {
    fn default() -> Self {
        Self {
            event_timeout_ms: 2_000,
            probe_timeout_ms: 100,
        }
    }
}

impl InertiaConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl SubscriberTiming {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl EngineConfig {
    /// Checks everything that can be checked without the palette.
    pub fn validate(&self) -> Result<()> {
        if self.columns == 0 || self.rows == 0 {
            return Err(EngineError::Config(format!(
                "grid must be at least 1x1, got {}x{}",
                self.columns, self.rows
            )));
        }

        let inertia = &self.inertia;
        let finite = [
            inertia.initial,
            inertia.floor,
            inertia.step,
            inertia.convergence_threshold,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(EngineError::Config("inertia values must be finite".into()));
        }
        if inertia.step <= 0.0 {
            return Err(EngineError::Config("inertia step must be positive".into()));
        }
        if inertia.floor > inertia.initial {
            return Err(EngineError::Config(format!(
                "inertia floor {} is above the initial value {}",
                inertia.floor, inertia.initial
            )));
        }
        if inertia.tick_ms == 0 {
            return Err(EngineError::Config("inertia tick must be non-zero".into()));
        }

        let bots = &self.bots;
        if bots.jitter_min_ms > bots.jitter_max_ms {
            return Err(EngineError::Config(
                "bot jitter minimum exceeds maximum".into(),
            ));
        }
        if !(bots.correct_multiplier > 0.0 && bots.wrong_multiplier > 0.0) {
            return Err(EngineError::Config(
                "bot delay multipliers must be positive".into(),
            ));
        }

        if self.subscriber.event_timeout_ms == 0 {
            return Err(EngineError::Config(
                "subscriber event timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
