//! Telemetry capture module
//!
//! Samples WiFi signal strength and battery level. WiFi comes from the
//! wireless stack when available (`iwconfig`, then `/proc/net/wireless`);
//! otherwise both values can be simulated with a bounded random walk.

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::state::TelemetrySample;

/// Limit for the `iwconfig` call
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Telemetry capture configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Random-walk values that can't be measured
    pub simulate: bool,
    /// Query the wireless stack for signal strength
    pub detect_real_wifi: bool,
    pub initial_wifi: u8,
    pub initial_battery: u8,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            simulate: true,
            detect_real_wifi: true,
            initial_wifi: 85,
            initial_battery: 67,
        }
    }
}

/// Where measured WiFi strength comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiProbe {
    /// `iwconfig`, falling back to `/proc/net/wireless`
    Wireless,
    /// Always report this strength (bench setups)
    Fixed(u8),
    /// No radio; every probe fails
    Unavailable,
}

impl WifiProbe {
    pub async fn probe(self) -> Result<u8> {
        match self {
            WifiProbe::Wireless => probe_wireless().await,
            WifiProbe::Fixed(value) => Ok(value.min(100)),
            WifiProbe::Unavailable => bail!("No wireless interface"),
        }
    }
}

/// Produces telemetry samples for the periodic status cycle
pub struct TelemetrySource {
    config: TelemetryConfig,
    probe: WifiProbe,
    wifi: u8,
    battery: u8,
    rng: StdRng,
}

impl TelemetrySource {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic source for tests and replays
    pub fn seeded(config: TelemetryConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: TelemetryConfig, rng: StdRng) -> Self {
        Self {
            wifi: config.initial_wifi.min(100),
            battery: config.initial_battery.min(100),
            probe: WifiProbe::Wireless,
            config,
            rng,
        }
    }

    pub fn with_probe(mut self, probe: WifiProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Most recent values without sampling
    pub fn current(&self) -> TelemetrySample {
        TelemetrySample::new(self.wifi, self.battery)
    }

    /// Take one sample.
    ///
    /// Fails only when real WiFi detection is on, simulation is off, and
    /// the probe finds nothing.
    pub async fn produce(&mut self) -> Result<TelemetrySample> {
        if self.config.detect_real_wifi {
            match self.probe.probe().await {
                Ok(wifi) => self.wifi = wifi,
                Err(e) if self.config.simulate => {
                    debug!("WiFi probe failed, simulating: {:#}", e);
                    self.wifi = self.walk(self.wifi, -5, 5, 10);
                }
                Err(e) => return Err(e.context("Could not read WiFi signal")),
            }
        } else if self.config.simulate {
            self.wifi = self.walk(self.wifi, -5, 5, 10);
        }

        if self.config.simulate {
            self.battery = self.walk(self.battery, -2, 1, 0);
        }

        Ok(self.current())
    }

    fn walk(&mut self, value: u8, down: i16, up: i16, floor: i16) -> u8 {
        let step = self.rng.random_range(down..=up);
        (i16::from(value) + step).clamp(floor, 100) as u8
    }
}

async fn probe_wireless() -> Result<u8> {
    match probe_iwconfig().await {
        Ok(wifi) => return Ok(wifi),
        Err(e) => debug!("iwconfig probe failed: {:#}", e),
    }

    let text = tokio::fs::read_to_string("/proc/net/wireless")
        .await
        .context("Failed to read /proc/net/wireless")?;
    parse_proc_wireless(&text).context("No wireless interface in /proc/net/wireless")
}

async fn probe_iwconfig() -> Result<u8> {
    let output = tokio::time::timeout(PROBE_TIMEOUT, Command::new("iwconfig").kill_on_drop(true).output())
        .await
        .context("iwconfig timed out")?
        .context("Failed to run iwconfig")?;

    if !output.status.success() {
        bail!("iwconfig exited with {}", output.status);
    }
    match parse_iwconfig_signal(&String::from_utf8_lossy(&output.stdout)) {
        Some(wifi) => Ok(wifi),
        None => {
            warn!("iwconfig output has no signal level");
            bail!("No signal level in iwconfig output")
        }
    }
}

/// Signal strength percentage from `iwconfig` output.
///
/// `Signal level=-NN dBm` maps linearly from -90 dBm (0%) to -30 dBm (100%).
pub fn parse_iwconfig_signal(output: &str) -> Option<u8> {
    output.lines().find_map(|line| {
        let rest = &line[line.find("Signal level=")? + "Signal level=".len()..];
        let end = rest
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
            .map_or(rest.len(), |(i, _)| i);
        let dbm: i64 = rest[..end].parse().ok()?;
        Some(((dbm + 90) * 100).div_euclid(60).clamp(0, 100) as u8)
    })
}

/// Signal quality percentage from `/proc/net/wireless` (first interface, 0-70 scale)
pub fn parse_proc_wireless(text: &str) -> Option<u8> {
    let line = text.lines().nth(2)?;
    let quality: f64 = line.split_whitespace().nth(2)?.trim_end_matches('.').parse().ok()?;
    Some((quality * 100.0 / 70.0).clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(simulate: bool, detect_real_wifi: bool) -> TelemetryConfig {
        TelemetryConfig {
            simulate,
            detect_real_wifi,
            ..Default::default()
        }
    }

    #[test]
    fn parses_iwconfig_signal_level() {
        let output = "wlan0     IEEE 802.11  ESSID:\"rov\"\n          \
                      Link Quality=52/70  Signal level=-58 dBm\n";
        assert_eq!(parse_iwconfig_signal(output), Some(53));
        assert_eq!(parse_iwconfig_signal("Signal level=-20 dBm"), Some(100));
        assert_eq!(parse_iwconfig_signal("Signal level=-95 dBm"), Some(0));
        assert_eq!(parse_iwconfig_signal("lo        no wireless extensions."), None);
    }

    #[test]
    fn parses_proc_net_wireless() {
        let text = "Inter-| sta-|   Quality        |   Discarded packets\n \
                    face | tus | link level noise |  nwid  crypt   frag\n \
                    wlan0: 0000   56.  -54.  -256        0      0      0\n";
        assert_eq!(parse_proc_wireless(text), Some(80));
        let header_only = text.lines().take(2).collect::<Vec<_>>().join("\n");
        assert_eq!(parse_proc_wireless(&header_only), None);
    }

    #[tokio::test]
    async fn simulated_values_stay_in_range() {
        let mut source = TelemetrySource::seeded(config(true, false), 7);
        let mut previous = source.current();
        assert_eq!(previous, TelemetrySample::new(85, 67));

        for _ in 0..500 {
            let sample = source.produce().await.unwrap();
            assert!((10..=100).contains(&sample.wifi_strength));
            assert!(sample.battery <= 100);
            let wifi_step = i16::from(sample.wifi_strength) - i16::from(previous.wifi_strength);
            let battery_step = i16::from(sample.battery) - i16::from(previous.battery);
            assert!((-5..=5).contains(&wifi_step));
            assert!((-2..=1).contains(&battery_step));
            previous = sample;
        }
    }

    #[tokio::test]
    async fn measured_wifi_wins_over_simulation() {
        let mut source = TelemetrySource::seeded(config(true, true), 1).with_probe(WifiProbe::Fixed(42));
        assert_eq!(source.produce().await.unwrap().wifi_strength, 42);
    }

    #[tokio::test]
    async fn probe_failure_without_simulation_is_an_error() {
        let mut source = TelemetrySource::seeded(config(false, true), 1).with_probe(WifiProbe::Unavailable);
        assert!(source.produce().await.is_err());
        assert_eq!(source.current(), TelemetrySample::new(85, 67));
    }

    #[tokio::test]
    async fn probe_failure_with_simulation_walks() {
        let mut source = TelemetrySource::seeded(config(true, true), 3).with_probe(WifiProbe::Unavailable);
        let sample = source.produce().await.unwrap();
        assert!((80..=90).contains(&sample.wifi_strength));
    }

    #[tokio::test]
    async fn values_hold_when_nothing_is_enabled() {
        let mut source = TelemetrySource::seeded(config(false, false), 1);
        for _ in 0..5 {
            assert_eq!(source.produce().await.unwrap(), TelemetrySample::new(85, 67));
        }
    }
}
