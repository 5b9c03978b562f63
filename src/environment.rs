use chrono::{DateTime, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

/// Weather factor used when no (known) weather condition is available
pub const DEFAULT_WEATHER_FACTOR: f64 = 0.5;

/// PV power above which the panels count as producing (W)
const PV_ACTIVE_W: f64 = 50.0;

/// Next-hour forecast above which production is expected (kWh)
const FORECAST_STRONG_KWH: f64 = 0.1;

/// Expected share of PV output for a Home Assistant weather condition
pub fn weather_factor(condition: Option<&str>) -> f64 {
    match condition {
        Some("sunny") => 1.0,
        Some("partlycloudy") => 0.8,
        Some("cloudy") | Some("windy") => 0.5,
        Some("snowy") => 0.4,
        Some("fog") => 0.3,
        Some("rainy") | Some("lightning") | Some("hail") => 0.1,
        Some("pouring") => 0.05,
        Some("clear-night") | Some("exceptional") => 0.0,
        _ => DEFAULT_WEATHER_FACTOR,
    }
}

/// Live readings and forecasts the solar assessment is based on
#[derive(Debug, Clone, Default)]
pub struct EnvironmentReadings {
    pub pv_power_w: f64,
    /// Forecast PV energy for the next hour (kWh)
    pub forecast_next_hour_kwh: f64,
    /// Forecast PV energy for the rest of today (kWh)
    pub forecast_remaining_kwh: f64,
    pub sun_elevation_deg: f64,
    pub weather: Option<String>,
    /// Raw state of the PV peak time sensor
    pub pv_peak_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarOutlook {
    pub is_daylight: bool,
    pub forecast_strong: bool,
    pub pv_active: bool,
    pub weather_factor: f64,
    pub approaching_peak: bool,
    pub is_sun_shining: bool,
}

impl SolarOutlook {
    pub fn assess(readings: &EnvironmentReadings, now: DateTime<Tz>) -> Self {
        let is_daylight = readings.sun_elevation_deg > 0.0;
        let forecast_strong = readings.forecast_next_hour_kwh > FORECAST_STRONG_KWH;
        let pv_active = readings.pv_power_w > PV_ACTIVE_W;
        let weather_factor = weather_factor(readings.weather.as_deref());
        let approaching_peak = approaching_pv_peak(readings.pv_peak_time.as_deref(), now);

        let is_sun_shining = pv_active
            || (is_daylight && weather_factor >= 0.4 && forecast_strong)
            || approaching_peak;

        Self {
            is_daylight,
            forecast_strong,
            pv_active,
            weather_factor,
            approaching_peak,
            is_sun_shining,
        }
    }
}

/// True when the PV peak started less than 30 minutes ago or is due within 90 minutes.
pub fn approaching_pv_peak(raw: Option<&str>, now: DateTime<Tz>) -> bool {
    let Some(peak) = raw.and_then(|s| parse_timestamp(s, now.timezone())) else {
        return false;
    };
    let diff_min = (peak - now).num_seconds() as f64 / 60.0;
    -30.0 < diff_min && diff_min < 90.0
}

/// Parse an ISO timestamp; a missing offset is taken as local time.
fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
}

/// Floor the battery may be discharged to.
///
/// A live inverter limit (if configured and readable) wins over the configured
/// minimum. Inverters that report "usable share" instead of a floor need `invert`.
pub fn effective_min_soc(live_limit: Option<f64>, invert: bool, configured_min_soc: f64) -> f64 {
    match live_limit {
        Some(value) => {
            let min_soc = if invert { 100.0 - value } else { value };
            min_soc.max(0.0)
        }
        None => configured_min_soc,
    }
}

/// Forecast PV energy (kWh) that reduces the grid charge needed
pub fn pv_deduction(forecast_remaining_kwh: f64, pv_safety_factor: f64) -> f64 {
    forecast_remaining_kwh * pv_safety_factor
}
