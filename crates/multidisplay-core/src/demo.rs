//! Demo Mode - simulated sensor unit
//!
//! Generates plausible sensor data for offline use and tests: an engine
//! idling at ~850 RPM with periodic boost pulls. Values are quantized to
//! what the wire format can carry, so encoding a demo sample is lossless.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{channels, DataSample, CHANNELS};

const IDLE_RPM: f64 = 850.0;
const PULL_UP_MS: u64 = 2500;
const PULL_HOLD_MS: u64 = 700;
const PULL_DOWN_MS: u64 = 1200;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    /// Throttle open, RPM and boost rising
    Pull { start_ms: u64 },
    /// At peak, holding
    Hold { start_ms: u64 },
    /// Lift off
    Lift { start_ms: u64 },
}

/// Simulated sensor unit
pub struct DemoSimulator {
    phase: Phase,
    next_pull_at_ms: u64,
    peak_rpm: f64,
    rpm: f64,
    /// Exhaust temperature lags load
    egt_base: f64,
    last_ms: Option<u64>,
    rng: StdRng,
}

impl Default for DemoSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoSimulator {
    /// Create a simulator with a random seed
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a reproducible simulator
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut rng: StdRng) -> Self {
        let first_pull = rng.gen_range(3000..6000);
        Self {
            phase: Phase::Idle,
            next_pull_at_ms: first_pull,
            peak_rpm: 0.0,
            rpm: IDLE_RPM,
            egt_base: 350.0,
            last_ms: None,
            rng,
        }
    }

    /// Produce the sample for `timestamp_ms`. Timestamps should not go backwards.
    pub fn sample(&mut self, timestamp_ms: u32) -> DataSample {
        let now = timestamp_ms as u64;
        let dt = self.last_ms.map_or(0, |last| now.saturating_sub(last)) as f64 / 1000.0;
        self.last_ms = Some(now);

        self.advance_phase(now);
        let target = self.target_rpm(now);
        let rate = if target > self.rpm { 2500.0 } else { 4000.0 };
        let step = rate * dt;
        self.rpm += (target - self.rpm).clamp(-step, step);

        let t = now as f64 / 1000.0;
        let load = ((self.rpm - IDLE_RPM) / 5000.0).clamp(0.0, 1.0);
        let pulling = !matches!(self.phase, Phase::Idle);

        let rpm = self.rpm + if pulling { 0.0 } else { 15.0 * (t * 2.3).sin() };
        let throttle = if pulling { 70.0 + 30.0 * load } else { 0.0 };
        let boost = if pulling { -0.1 + 1.6 * load } else { -0.65 } + 0.02 * (t * 5.0).sin();
        let lambda = if pulling { 0.82 } else { 1.0 } + 0.02 * (t * 1.7).sin();
        let lmm = 1.0 + 3.5 * load;

        let egt_target = 350.0 + 550.0 * load;
        self.egt_base += (egt_target - self.egt_base) * (dt * 0.5).min(1.0);

        let speed = (rpm / 1000.0) * 22.0;
        let gear = if pulling { 3.0 } else { 0.0 };
        let n75_setpoint = if pulling { 1.5 } else { 0.0 };
        let n75_duty = if pulling { 120.0 + 80.0 * load } else { 0.0 };
        let knock = 0.4 + 0.3 * load + self.rng.gen_range(0.0..0.1);
        let df_map = (boost + 1.0) / 2.0 * 255.0;

        let mut values = vec![0.0; CHANNELS.len()];
        values[0] = rpm;
        values[1] = boost;
        values[2] = throttle;
        values[3] = lambda;
        values[4] = lmm;
        values[5] = 35.0 + 0.5 * (t * 0.05).sin();
        for n in 0..channels::EGT_CHANNELS {
            let spread = 15.0 * n as f64 - 50.0;
            values[channels::FIRST_EGT_INDEX + n] =
                self.egt_base + spread + self.rng.gen_range(-3.0..3.0);
        }
        values[14] = 13.9 + 0.15 * (t * 0.4).sin();
        values[15] = 1.5 + 3.0 * load;
        values[16] = 90.0 + 5.0 * load;
        values[17] = speed;
        values[18] = gear;
        values[19] = n75_duty;
        values[20] = n75_setpoint;
        values[21] = knock;
        values[channels::DF_MAP_INDEX] = df_map;

        DataSample::new(timestamp_ms, quantize(values))
    }

    /// `count` samples spaced `interval_ms` apart, starting at zero
    pub fn generate(&mut self, count: usize, interval_ms: u32) -> Vec<DataSample> {
        (0..count)
            .map(|i| self.sample((i as u32).saturating_mul(interval_ms)))
            .collect()
    }

    fn advance_phase(&mut self, now: u64) {
        self.phase = match self.phase {
            Phase::Idle if now >= self.next_pull_at_ms => {
                self.peak_rpm = self.rng.gen_range(4500.0..6200.0);
                Phase::Pull { start_ms: now }
            }
            Phase::Pull { start_ms } if now >= start_ms + PULL_UP_MS => {
                Phase::Hold { start_ms: now }
            }
            Phase::Hold { start_ms } if now >= start_ms + PULL_HOLD_MS => {
                Phase::Lift { start_ms: now }
            }
            Phase::Lift { start_ms } if now >= start_ms + PULL_DOWN_MS => {
                self.next_pull_at_ms = now + self.rng.gen_range(6000..12000);
                Phase::Idle
            }
            phase => phase,
        };
    }

    fn target_rpm(&self, now: u64) -> f64 {
        let progress = |start: u64, span: u64| ((now - start) as f64 / span as f64).min(1.0);
        match self.phase {
            Phase::Idle => IDLE_RPM,
            Phase::Pull { start_ms } => {
                IDLE_RPM + (self.peak_rpm - IDLE_RPM) * progress(start_ms, PULL_UP_MS)
            }
            Phase::Hold { .. } => self.peak_rpm,
            Phase::Lift { start_ms } => {
                self.peak_rpm + (IDLE_RPM - self.peak_rpm) * progress(start_ms, PULL_DOWN_MS)
            }
        }
    }
}

/// Clamp to each channel's valid range and round to its wire resolution
fn quantize(mut values: Vec<f64>) -> Vec<f64> {
    for (value, def) in values.iter_mut().zip(CHANNELS) {
        *value = def.to_physical(def.to_raw(value.clamp(def.min, def.max)));
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_is_reproducible() {
        let a = DemoSimulator::seeded(7).generate(50, 100);
        let b = DemoSimulator::seeded(7).generate(50, 100);
        assert_eq!(a, b);
    }

    #[test]
    fn test_values_in_range() {
        let mut sim = DemoSimulator::seeded(1);
        for sample in sim.generate(600, 50) {
            assert_eq!(sample.values.len(), CHANNELS.len());
            for (value, def) in sample.values.iter().zip(CHANNELS) {
                assert!(def.in_range(*value), "{} = {} out of range", def.name, value);
            }
        }
    }

    #[test]
    fn test_idle_rpm_range() {
        let mut sim = DemoSimulator::seeded(3);
        // First pull starts no earlier than 3 s
        for sample in sim.generate(25, 100) {
            assert!(
                sample.rpm() > 800.0 && sample.rpm() < 900.0,
                "RPM {} out of idle range",
                sample.rpm()
            );
        }
    }
}
