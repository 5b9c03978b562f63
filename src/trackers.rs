use chrono::Duration;

/// Grid import (W, negative) that counts as charging from the grid
const GRID_IMPORT_W: f64 = -50.0;

/// Battery output (W) that counts as discharging
const DISCHARGE_W: f64 = 50.0;

/// Longest gap between ticks that is still integrated
pub const MAX_INTEGRATION_GAP_SECS: i64 = 15 * 60;

/// Instantaneous power readings of one tick (W)
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerReadings {
    pub pv_w: f64,
    pub house_w: f64,
    /// Negative while importing from the grid
    pub grid_w: f64,
    /// Positive while the battery discharges
    pub battery_w: f64,
}

/// Running cost and energy totals for the process lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyTrackers {
    /// EUR paid for grid charging
    pub cost_total: f64,
    /// EUR saved on grid charging compared to the reference price
    pub savings_total: f64,
    /// EUR value of energy discharged from the battery
    pub discharge_savings: f64,
    /// EUR value of PV power consumed directly
    pub pv_savings: f64,
    /// kWh charged from the grid
    pub charged_kwh: f64,
}

impl EnergyTrackers {
    /// Book one interval of `elapsed` at the given readings. Returns the kWh
    /// imported into the battery (0 unless a charging session is active).
    pub fn accrue(
        &mut self,
        readings: &PowerReadings,
        price: f64,
        reference_price: f64,
        charging_session_active: bool,
        elapsed: Duration,
    ) -> f64 {
        let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        let kwh = |watts: f64| watts / 1000.0 * hours;

        if readings.pv_w > 0.0 && readings.house_w > 0.0 {
            self.pv_savings += kwh(readings.pv_w.min(readings.house_w)) * price;
        }

        let mut charged = 0.0;
        if charging_session_active && readings.grid_w < GRID_IMPORT_W {
            charged = kwh(readings.grid_w.abs());
            self.charged_kwh += charged;
            self.cost_total += charged * price;
            self.savings_total += charged * (reference_price - price);
        }

        if readings.battery_w > DISCHARGE_W {
            self.discharge_savings += kwh(readings.battery_w) * price;
        }

        charged
    }
}

/// Time to integrate over: the real gap, clamped, or `nominal` without a previous tick
pub fn integration_interval(since_last_tick: Option<Duration>, nominal: Duration) -> Duration {
    match since_last_tick {
        None => nominal,
        Some(gap) if gap < Duration::zero() => Duration::zero(),
        Some(gap) => gap.min(Duration::seconds(MAX_INTEGRATION_GAP_SECS)),
    }
}
