//! Field sensor simulator for running the hub without hardware.
//!
//! Each step evolves soil moisture as a mean-reverting random walk with a
//! drying drift, pushes it up while the simulated pump runs, and derives the
//! temperatures and air humidity around slow baselines with small noise.

use std::fmt;

// ---------------------------------------------------------------------------
// Noise
// ---------------------------------------------------------------------------

/// Irwin-Hall approximation of N(0,1): twelve uniforms minus six.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profile selected with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries out steadily, as on a hot day.
    Drying,
    /// Hovers around the middle with little noise.
    Stable,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    /// (start moisture %, drift per step, walk sigma, mean reversion)
    fn params(self) -> (f64, f64, f64, f64) {
        match self {
            Self::Drying => (55.0, -0.6, 0.8, 0.01),
            Self::Stable => (50.0, -0.05, 0.3, 0.05),
            Self::Wet => (85.0, -0.1, 0.5, 0.01),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One simulated measurement, rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub moisture_percent: f64,
    pub soil_temperature: f64,
    pub air_temperature: f64,
    pub air_humidity: f64,
}

pub struct FieldSim {
    moisture: f64,
    center: f64,
    drift_per_step: f64,
    walk_sigma: f64,
    mean_reversion: f64,

    soil_temp_base: f64,
    air_temp_base: f64,
    air_hum_base: f64,

    pump_on: bool,
    wet_rate: f64,
}

impl FieldSim {
    pub fn new(scenario: Scenario) -> Self {
        let (start, drift, walk_sigma, mean_reversion) = scenario.params();
        Self {
            moisture: (start + gaussian(0.0, 2.0)).clamp(0.0, 100.0),
            center: 50.0,
            drift_per_step: drift,
            walk_sigma,
            mean_reversion,
            soil_temp_base: 26.0,
            air_temp_base: 30.0,
            air_hum_base: 70.0,
            pump_on: false,
            wet_rate: 4.0,
        }
    }

    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    /// Advance one sampling period and return the new measurement.
    pub fn step(&mut self) -> Sample {
        let pull = self.mean_reversion * (self.center - self.moisture);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.pump_on { self.wet_rate } else { 0.0 };

        self.moisture = (self.moisture + self.drift_per_step + pull + walk + wet).clamp(0.0, 100.0);

        // Wet soil runs slightly cooler.
        let soil_temp = self.soil_temp_base - 0.03 * (self.moisture - self.center)
            + gaussian(0.0, 0.2);
        let air_temp = self.air_temp_base + gaussian(0.0, 0.5);
        let air_hum = (self.air_hum_base + gaussian(0.0, 2.0)).clamp(0.0, 100.0);

        Sample {
            moisture_percent: round1(self.moisture),
            soil_temperature: round1(soil_temp),
            air_temperature: round1(air_temp),
            air_humidity: round1(air_hum),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_moisture(sim: &mut FieldSim, n: usize) -> f64 {
        (0..n).map(|_| sim.step().moisture_percent).sum::<f64>() / n as f64
    }

    #[test]
    fn readings_stay_in_physical_range() {
        for scenario in [Scenario::Drying, Scenario::Stable, Scenario::Wet] {
            let mut sim = FieldSim::new(scenario);
            for i in 0..1000 {
                sim.set_pump(i % 200 < 50);
                let s = sim.step();
                assert!((0.0..=100.0).contains(&s.moisture_percent), "{s:?}");
                assert!((0.0..=100.0).contains(&s.air_humidity), "{s:?}");
                assert!((10.0..=45.0).contains(&s.soil_temperature), "{s:?}");
            }
        }
    }

    #[test]
    fn consecutive_readings_are_coherent() {
        let mut sim = FieldSim::new(Scenario::Stable);
        let samples: Vec<f64> = (0..200).map(|_| sim.step().moisture_percent).collect();
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f64::max);
        assert!(max_jump < 10.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn drying_scenario_dries_out() {
        let mut sim = FieldSim::new(Scenario::Drying);
        let before = mean_moisture(&mut sim, 10);
        for _ in 0..100 {
            sim.step();
        }
        let after = mean_moisture(&mut sim, 10);
        assert!(after < before, "before={before:.1} after={after:.1}");
    }

    #[test]
    fn pump_wets_the_soil() {
        let mut sim = FieldSim::new(Scenario::Drying);
        for _ in 0..100 {
            sim.step();
        }
        let before = mean_moisture(&mut sim, 10);

        sim.set_pump(true);
        assert!(sim.pump_on());
        for _ in 0..20 {
            sim.step();
        }
        let after = mean_moisture(&mut sim, 10);
        assert!(after > before, "before={before:.1} after={after:.1}");
    }

    #[test]
    fn wet_scenario_starts_high() {
        let mut sim = FieldSim::new(Scenario::Wet);
        assert!(mean_moisture(&mut sim, 5) > 70.0);
    }

    #[test]
    fn samples_are_rounded_to_one_decimal() {
        let mut sim = FieldSim::new(Scenario::Stable);
        let s = sim.step();
        for v in [s.moisture_percent, s.soil_temperature, s.air_temperature, s.air_humidity] {
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9, "{v}");
        }
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy(" wet "), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
    }

    #[test]
    fn scenario_display_round_trips() {
        for s in [Scenario::Drying, Scenario::Stable, Scenario::Wet] {
            assert_eq!(Scenario::from_str_lossy(&s.to_string()), s);
        }
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
