use anyhow::Result;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::errors::EngineError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tibber: TibberConfig,
    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    pub entities: EntityConfig,
    /// Stored option values, overridden by the live options file
    #[serde(default)]
    pub settings: OptionOverrides,
    /// Options file re-read on every tick
    pub options_path: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TibberConfig {
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_tibber_url")]
    pub api_url: String,
    /// How often to refresh prices (in seconds), default 15 minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_tibber_url() -> String {
    "https://api.tibber.com/v1-beta/gql".to_string()
}

fn default_refresh_interval() -> u64 {
    900 // 15 minutes
}

#[derive(Debug, Deserialize, Clone)]
pub struct HomeAssistantConfig {
    #[serde(default = "default_ha_url")]
    pub base_url: String,
    /// Long-lived token; falls back to SUPERVISOR_TOKEN when unset
    pub token: Option<String>,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            base_url: default_ha_url(),
            token: None,
        }
    }
}

fn default_ha_url() -> String {
    "http://supervisor/core".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Prefix for the state and control topics
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "smart-price-charge".to_string()
}

fn default_base_topic() -> String {
    "smart_price_charge".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatteryConfig {
    /// Battery capacity in kWh
    #[serde(default = "default_capacity")]
    pub capacity_kwh: f64,
    /// Grid charging power in kW
    #[serde(default = "default_charger_power")]
    pub charger_power_kw: f64,
    /// Price (EUR/kWh) that grid charging savings are measured against
    #[serde(default = "default_reference_price")]
    pub reference_price: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: default_capacity(),
            charger_power_kw: default_charger_power(),
            reference_price: default_reference_price(),
        }
    }
}

fn default_capacity() -> f64 {
    10.0
}

fn default_charger_power() -> f64 {
    3.0
}

fn default_reference_price() -> f64 {
    0.35
}

/// Home Assistant entity ids the engine reads from and writes to
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EntityConfig {
    pub soc: Option<String>,
    /// select / input_select holding the inverter work mode
    pub inverter_mode: Option<String>,
    pub pv_power: Option<String>,
    pub grid_power: Option<String>,
    pub battery_power: Option<String>,
    pub house_power: Option<String>,
    pub avg_consumption: Option<String>,
    pub pv_peak_time: Option<String>,
    pub pv_forecast_next_hour: Option<String>,
    pub pv_forecast_remaining: Option<String>,
    pub weather: Option<String>,
    #[serde(default = "default_sun_entity")]
    pub sun: Option<String>,
}

fn default_sun_entity() -> Option<String> {
    Some("sun.sun".to_string())
}

/// One layer of option values. Unset fields fall through to the next layer.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct OptionOverrides {
    pub target_soc: Option<f64>,
    pub min_soc: Option<f64>,
    pub inverter_min_soc_entity: Option<String>,
    pub inverter_min_soc_invert: Option<bool>,
    pub battery_efficiency: Option<f64>,
    pub pv_safety_factor: Option<f64>,
    pub min_profit: Option<f64>,
    pub min_spread: Option<f64>,
    pub soc_med: Option<f64>,
    pub spread_med: Option<f64>,
    pub soc_high: Option<f64>,
    pub spread_high: Option<f64>,
    pub sleep_soc: Option<f64>,
    pub morning_diff: Option<f64>,
    pub notify_active: Option<bool>,
    pub notify_service: Option<String>,
    pub mode_option_normal: Option<String>,
    pub mode_option_force_charge: Option<String>,
}

pub const DEFAULT_TARGET_SOC: f64 = 100.0;
pub const DEFAULT_MIN_SOC: f64 = 10.0;
pub const DEFAULT_EFFICIENCY: f64 = 0.90;
pub const DEFAULT_PV_SAFETY: f64 = 1.1;
pub const DEFAULT_MIN_PROFIT: f64 = 0.02;
pub const DEFAULT_MIN_SPREAD: f64 = 0.05;
pub const DEFAULT_SOC_MED: f64 = 50.0;
pub const DEFAULT_SPREAD_MED: f64 = 0.10;
pub const DEFAULT_SOC_HIGH: f64 = 80.0;
pub const DEFAULT_SPREAD_HIGH: f64 = 0.15;
pub const DEFAULT_SLEEP_SOC: f64 = 15.0;
pub const DEFAULT_MORNING_DIFF: f64 = 0.05;

/// Fully resolved options for one tick
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub target_soc: f64,
    pub min_soc: f64,
    pub inverter_min_soc_entity: Option<String>,
    pub inverter_min_soc_invert: bool,
    pub battery_efficiency: f64,
    pub pv_safety_factor: f64,
    pub min_profit: f64,
    pub min_spread: f64,
    pub soc_med: f64,
    pub spread_med: f64,
    pub soc_high: f64,
    pub spread_high: f64,
    pub sleep_soc: f64,
    pub morning_diff: f64,
    pub notify_active: bool,
    pub notify_service: Option<String>,
    pub mode_option_normal: String,
    pub mode_option_force_charge: String,
}

impl Default for Options {
    fn default() -> Self {
        Self::resolve(&OptionOverrides::default(), &OptionOverrides::default())
    }
}

impl Options {
    /// Live options win over stored settings, which win over the defaults.
    pub fn resolve(live: &OptionOverrides, stored: &OptionOverrides) -> Self {
        fn pick<T: Clone>(live: &Option<T>, stored: &Option<T>) -> Option<T> {
            live.clone().or_else(|| stored.clone())
        }

        Self {
            target_soc: pick(&live.target_soc, &stored.target_soc).unwrap_or(DEFAULT_TARGET_SOC),
            min_soc: pick(&live.min_soc, &stored.min_soc).unwrap_or(DEFAULT_MIN_SOC),
            inverter_min_soc_entity: pick(
                &live.inverter_min_soc_entity,
                &stored.inverter_min_soc_entity,
            )
            .filter(|e| !e.is_empty()),
            inverter_min_soc_invert: pick(
                &live.inverter_min_soc_invert,
                &stored.inverter_min_soc_invert,
            )
            .unwrap_or(false),
            battery_efficiency: pick(&live.battery_efficiency, &stored.battery_efficiency)
                .unwrap_or(DEFAULT_EFFICIENCY),
            pv_safety_factor: pick(&live.pv_safety_factor, &stored.pv_safety_factor)
                .unwrap_or(DEFAULT_PV_SAFETY),
            min_profit: pick(&live.min_profit, &stored.min_profit).unwrap_or(DEFAULT_MIN_PROFIT),
            min_spread: pick(&live.min_spread, &stored.min_spread).unwrap_or(DEFAULT_MIN_SPREAD),
            soc_med: pick(&live.soc_med, &stored.soc_med).unwrap_or(DEFAULT_SOC_MED),
            spread_med: pick(&live.spread_med, &stored.spread_med).unwrap_or(DEFAULT_SPREAD_MED),
            soc_high: pick(&live.soc_high, &stored.soc_high).unwrap_or(DEFAULT_SOC_HIGH),
            spread_high: pick(&live.spread_high, &stored.spread_high)
                .unwrap_or(DEFAULT_SPREAD_HIGH),
            sleep_soc: pick(&live.sleep_soc, &stored.sleep_soc).unwrap_or(DEFAULT_SLEEP_SOC),
            morning_diff: pick(&live.morning_diff, &stored.morning_diff)
                .unwrap_or(DEFAULT_MORNING_DIFF),
            notify_active: pick(&live.notify_active, &stored.notify_active).unwrap_or(true),
            notify_service: pick(&live.notify_service, &stored.notify_service)
                .filter(|s| !s.is_empty()),
            mode_option_normal: pick(&live.mode_option_normal, &stored.mode_option_normal)
                .unwrap_or_else(|| "general".to_string()),
            mode_option_force_charge: pick(
                &live.mode_option_force_charge,
                &stored.mode_option_force_charge,
            )
            .unwrap_or_else(|| "eco_charge".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let percentages = [
            ("target_soc", self.target_soc),
            ("min_soc", self.min_soc),
            ("soc_med", self.soc_med),
            ("soc_high", self.soc_high),
            ("sleep_soc", self.sleep_soc),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(EngineError::InvalidOptions(format!(
                    "{} must be within 0..=100, got {}",
                    name, value
                )));
            }
        }

        if !(self.battery_efficiency > 0.0 && self.battery_efficiency <= 1.0) {
            return Err(EngineError::InvalidOptions(format!(
                "battery_efficiency must be within (0, 1], got {}",
                self.battery_efficiency
            )));
        }

        let non_negative = [
            ("pv_safety_factor", self.pv_safety_factor),
            ("min_profit", self.min_profit),
            ("min_spread", self.min_spread),
            ("spread_med", self.spread_med),
            ("spread_high", self.spread_high),
            ("morning_diff", self.morning_diff),
        ];
        for (name, value) in non_negative {
            if value < 0.0 || value.is_nan() {
                return Err(EngineError::InvalidOptions(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Read the live options file. A missing file is an empty layer.
pub fn load_live_options(path: Option<&str>) -> OptionOverrides {
    let Some(path) = path else {
        return OptionOverrides::default();
    };
    let path = Path::new(path);
    if !path.exists() {
        return OptionOverrides::default();
    }

    // YAML is a superset of JSON, so this covers both formats
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|content| serde_yaml::from_str::<OptionOverrides>(&content).map_err(Into::into))
    {
        Ok(overrides) => overrides,
        Err(e) => {
            warn!("Ignoring unreadable options file {}: {}", path.display(), e);
            OptionOverrides::default()
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_from_env_or_file() -> Result<Self> {
        // Home Assistant addons typically use /data/options.json
        let ha_options = Path::new("/data/options.json");
        if ha_options.exists() {
            let content = std::fs::read_to_string(ha_options)?;
            let config: Config = serde_json::from_str(&content)?;
            return Ok(config);
        }

        // Fall back to config.yaml in current directory or /config
        let paths = ["config.yaml", "/config/smart-price-charge.yaml"];
        for path in paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        anyhow::bail!("No configuration file found")
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let options = Options::default();
        assert_eq!(options.target_soc, 100.0);
        assert_eq!(options.min_soc, 10.0);
        assert_eq!(options.pv_safety_factor, 1.1);
        assert_eq!(options.spread_high, 0.15);
        assert!(options.notify_active);
        assert!(options.notify_service.is_none());
        assert_eq!(options.mode_option_normal, "general");
        assert_eq!(options.mode_option_force_charge, "eco_charge");
    }

    #[test]
    fn test_resolve_live_beats_stored_beats_default() {
        let stored = OptionOverrides {
            target_soc: Some(90.0),
            min_soc: Some(20.0),
            notify_service: Some("notify.phone".to_string()),
            ..Default::default()
        };
        let live = OptionOverrides {
            target_soc: Some(80.0),
            ..Default::default()
        };

        let options = Options::resolve(&live, &stored);
        assert_eq!(options.target_soc, 80.0);
        assert_eq!(options.min_soc, 20.0);
        assert_eq!(options.sleep_soc, DEFAULT_SLEEP_SOC);
        assert_eq!(options.notify_service.as_deref(), Some("notify.phone"));
    }

    #[test]
    fn test_resolve_treats_empty_entity_as_unset() {
        let live = OptionOverrides {
            inverter_min_soc_entity: Some(String::new()),
            ..Default::default()
        };
        let options = Options::resolve(&live, &OptionOverrides::default());
        assert!(options.inverter_min_soc_entity.is_none());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut options = Options::default();
        assert!(options.validate().is_ok());

        options.target_soc = 120.0;
        assert!(matches!(options.validate(), Err(EngineError::InvalidOptions(_))));

        let mut options = Options::default();
        options.battery_efficiency = 0.0;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.min_spread = -0.01;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_config_parses_minimal_yaml() {
        let yaml = r#"
tibber:
  api_token: abc
mqtt:
  host: localhost
entities:
  soc: sensor.battery_soc
  inverter_mode: select.inverter_mode
settings:
  min_soc: 15
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tibber.refresh_interval_secs, 900);
        assert_eq!(config.battery.capacity_kwh, 10.0);
        assert_eq!(config.battery.charger_power_kw, 3.0);
        assert_eq!(config.entities.sun.as_deref(), Some("sun.sun"));
        assert_eq!(config.settings.min_soc, Some(15.0));
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_missing_live_options_file_is_empty_layer() {
        let overrides = load_live_options(Some("/nonexistent/options.yaml"));
        assert!(overrides.target_soc.is_none());
        assert!(load_live_options(None).min_soc.is_none());
    }
}
