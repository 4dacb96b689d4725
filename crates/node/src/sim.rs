//! Stateful model of a single greenlink field device.
//!
//! Models enough behaviour to exercise the hub end to end:
//! - Soil moisture as a random walk with mean reversion and drying drift
//! - 10-bit capacitive probe readings (higher raw = drier) with ADC noise
//! - Occasional spikes (sensor flakiness)
//! - Diurnal air/soil temperature and inverse humidity cycle
//! - Pump response (soil gets wetter while the pump runs)
//! - Manual override via hub commands, local hysteresis control in AUTO
//! - Cumulative pump runtime counter

use serde::Serialize;
use std::fmt;

/// Full scale of the probe ADC.
pub const ADC_MAX: f64 = 1024.0;

/// Raw reading in bone-dry soil.
const RAW_DRY: f64 = 850.0;
/// Raw reading in saturated soil.
const RAW_WET: f64 = 350.0;

/// AUTO turns the pump on below this moisture...
const AUTO_ON_BELOW_PCT: f64 = 30.0;
/// ...and off again above this one.
const AUTO_OFF_ABOVE_PCT: f64 = 60.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily. AUTO will water periodically.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// High noise and frequent spikes. Some samples land outside the valid
    /// range so the hub's rejection path gets traffic too.
    Flaky,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands from the hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PumpOn,
    PumpOff,
    Auto,
}

impl Command {
    /// Parse a command payload. Unknown payloads are ignored by the caller.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match std::str::from_utf8(payload).ok()?.trim() {
            "PUMP_ON" => Some(Self::PumpOn),
            "PUMP_OFF" => Some(Self::PumpOff),
            "AUTO" => Some(Self::Auto),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire message
// ---------------------------------------------------------------------------

/// One telemetry message as published on the telemetry topic.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub s_raw: i32,
    pub s_pct: f64,
    pub s_temp: f64,
    pub a_temp: f64,
    pub hum: f64,
    pub pump: u8,
    pub man: u8,
    pub life: f64,
}

// ---------------------------------------------------------------------------
// Device model
// ---------------------------------------------------------------------------

pub struct DeviceSim {
    /// "True" soil moisture in raw ADC units. Evolves each step.
    soil: f64,

    // Random walk parameters (per minute of simulated time)
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,

    spike_prob: f32,
    spike_sigma: f64,

    diurnal_period_s: f64,

    pump_on: bool,
    manual: bool,
    /// Seconds the pump has run since boot.
    pump_life_s: f64,
    /// Raw units per minute the pump pulls the soil toward wet.
    wet_rate: f64,
}

impl DeviceSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let range = RAW_DRY - RAW_WET;
        let center = (RAW_DRY + RAW_WET) / 2.0;

        // start_frac: 0.0 = saturated, 1.0 = bone dry
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                Scenario::Drying => (4.0, 4.0, 0.01, 3.0, 0.02_f32, 60.0, 0.5),
                Scenario::Stable => (0.5, 1.5, 0.05, 1.5, 0.002, 30.0, 0.5),
                Scenario::Flaky => (3.0, 8.0, 0.02, 10.0, 0.10, 400.0, 0.5),
                Scenario::Wet => (0.8, 2.0, 0.01, 2.0, 0.01, 40.0, 0.1),
            };

        Self {
            soil: RAW_WET + start_frac * range + gaussian(0.0, range * 0.02),
            drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center,
            noise_sigma,
            spike_prob,
            spike_sigma,
            diurnal_period_s,
            pump_on: false,
            manual: false,
            pump_life_s: 0.0,
            wet_rate: -40.0,
        }
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    pub fn manual(&self) -> bool {
        self.manual
    }

    /// Apply a hub command. PUMP_ON/PUMP_OFF take manual control; AUTO
    /// hands the pump back to the local thresholds.
    pub fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::PumpOn => {
                self.manual = true;
                self.pump_on = true;
            }
            Command::PumpOff => {
                self.manual = true;
                self.pump_on = false;
            }
            Command::Auto => {
                self.manual = false;
                self.auto_control(self.moisture_pct(self.soil));
            }
        }
    }

    /// Advance the model by `dt_s` seconds and produce a reading.
    /// `clock_s` positions the sample within the diurnal cycle.
    pub fn step(&mut self, dt_s: f64, clock_s: f64) -> Telemetry {
        let minutes = dt_s / 60.0;

        if self.pump_on {
            self.pump_life_s += dt_s;
        }

        // -- Evolve soil ----------------------------------------------------

        let pull = self.mean_reversion * (self.center - self.soil) * minutes;
        let walk = gaussian(0.0, self.walk_sigma * minutes.sqrt());
        let wet = if self.pump_on { self.wet_rate * minutes } else { 0.0 };
        self.soil = (self.soil + self.drift * minutes + pull + walk + wet)
            .clamp(RAW_WET - 30.0, RAW_DRY + 30.0);

        // -- Instantaneous reading -----------------------------------------

        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };
        let raw = (self.soil + gaussian(0.0, self.noise_sigma) + spike)
            .round()
            .clamp(0.0, ADC_MAX * 1.5);
        let pct = self.moisture_pct(raw);

        // Afternoon peak at period/2: warmer, drier air.
        let phase = 2.0 * std::f64::consts::PI * clock_s / self.diurnal_period_s;
        let day = phase.sin();
        let a_temp = 20.0 + 6.0 * day + gaussian(0.0, 0.2);
        let s_temp = 17.0 + 2.5 * day + gaussian(0.0, 0.1);
        let hum = (60.0 - 15.0 * day + gaussian(0.0, 1.0)).clamp(0.0, 100.0);

        if !self.manual {
            self.auto_control(pct);
        }

        Telemetry {
            s_raw: raw as i32,
            s_pct: round1(pct),
            s_temp: round1(s_temp),
            a_temp: round1(a_temp),
            hum: round1(hum),
            pump: self.pump_on as u8,
            man: self.manual as u8,
            life: self.pump_life_s.round(),
        }
    }

    fn auto_control(&mut self, pct: f64) {
        if pct < AUTO_ON_BELOW_PCT {
            self.pump_on = true;
        } else if pct > AUTO_OFF_ABOVE_PCT {
            self.pump_on = false;
        }
    }

    fn moisture_pct(&self, raw: f64) -> f64 {
        ((RAW_DRY - raw) / (RAW_DRY - RAW_WET) * 100.0).clamp(0.0, 100.0)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(sim: &mut DeviceSim, n: usize) -> Vec<Telemetry> {
        (0..n).map(|i| sim.step(60.0, i as f64 * 60.0)).collect()
    }

    #[test]
    fn stable_readings_within_hub_ranges() {
        let mut sim = DeviceSim::new(Scenario::Stable, 600.0);
        for t in run(&mut sim, 500) {
            assert!((0..=1024).contains(&t.s_raw), "raw out of range: {}", t.s_raw);
            assert!((0.0..=100.0).contains(&t.s_pct));
            assert!((0.0..=100.0).contains(&t.hum));
            assert!(t.life >= 0.0);
        }
    }

    #[test]
    fn temporal_coherence() {
        let mut sim = DeviceSim::new(Scenario::Stable, 600.0);
        let samples = run(&mut sim, 100);
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1].s_raw - w[0].s_raw).abs())
            .max()
            .unwrap();
        assert!(max_jump < 200, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn pump_wets_soil() {
        let mut sim = DeviceSim::new(Scenario::Drying, 600.0);
        run(&mut sim, 10);
        let before: f64 = run(&mut sim, 10).iter().map(|t| t.s_raw as f64).sum::<f64>() / 10.0;

        sim.apply(Command::PumpOn);
        run(&mut sim, 20);
        let after: f64 = run(&mut sim, 10).iter().map(|t| t.s_raw as f64).sum::<f64>() / 10.0;

        assert!(
            after < before,
            "pumping should lower raw readings: before={before:.0} after={after:.0}"
        );
    }

    #[test]
    fn manual_commands_hold_until_auto() {
        let mut sim = DeviceSim::new(Scenario::Wet, 600.0);
        sim.apply(Command::PumpOn);
        let t = sim.step(60.0, 0.0);
        assert_eq!((t.pump, t.man), (1, 1));

        // Wet soil would switch the pump off in AUTO, but manual holds.
        for t in run(&mut sim, 5) {
            assert_eq!(t.pump, 1);
        }

        sim.apply(Command::PumpOff);
        let t = sim.step(60.0, 0.0);
        assert_eq!((t.pump, t.man), (0, 1));

        sim.apply(Command::Auto);
        assert!(!sim.manual());
    }

    #[test]
    fn auto_waters_dry_soil() {
        let mut sim = DeviceSim::new(Scenario::Drying, 600.0);
        sim.soil = RAW_DRY;
        sim.apply(Command::Auto);
        assert!(sim.pump_on());
    }

    #[test]
    fn pump_life_accumulates_only_while_running() {
        let mut sim = DeviceSim::new(Scenario::Stable, 600.0);
        sim.apply(Command::PumpOff);
        sim.step(60.0, 0.0);
        assert_eq!(sim.step(60.0, 0.0).life, 0.0);

        sim.apply(Command::PumpOn);
        sim.step(30.0, 0.0);
        let t = sim.step(30.0, 0.0);
        assert_eq!(t.life, 60.0);
    }

    #[test]
    fn command_parse() {
        assert_eq!(Command::parse(b"PUMP_ON"), Some(Command::PumpOn));
        assert_eq!(Command::parse(b" PUMP_OFF\n"), Some(Command::PumpOff));
        assert_eq!(Command::parse(b"AUTO"), Some(Command::Auto));
        assert_eq!(Command::parse(b"pump_on"), None);
        assert_eq!(Command::parse(&[0xff, 0xfe]), None);
    }

    #[test]
    fn telemetry_uses_wire_field_names() {
        let mut sim = DeviceSim::new(Scenario::Stable, 600.0);
        let json = serde_json::to_value(sim.step(60.0, 0.0)).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["s_raw", "s_pct", "s_temp", "a_temp", "hum", "pump", "man", "life"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj.len(), 8);
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
        assert_eq!(Scenario::Wet.to_string(), "wet");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
