use chrono::{DateTime, Duration, NaiveDate, Timelike};
use chrono_tz::Tz;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::bridge::{read_entity, read_numeric, read_optional_numeric, read_text, HomeBridge};
use crate::config::{BatteryConfig, EntityConfig, Options};
use crate::environment::{effective_min_soc, pv_deduction, EnvironmentReadings, SolarOutlook};
use crate::errors::EngineError;
use crate::tibber::PriceFeed;
use crate::timeline::{PriceTimeline, SlotPlan, HIGH_PRICE_THRESHOLD};
use crate::trackers::{integration_interval, EnergyTrackers, PowerReadings};

/// A repeated identical mode command is suppressed within this window
const MODE_DEBOUNCE_SECS: i64 = 900;

/// Panic charging when the peak is closer than this (hours)...
const PANIC_PEAK_HOURS: f64 = 1.5;
/// ...and SoC is less than this above the minimum
const PANIC_SOC_MARGIN: f64 = 5.0;

/// Upper bound for planned charging slots (4 hours)
const MAX_CHARGE_SLOTS: usize = 16;

/// Sessions charging less than this end without a notification (kWh)
const SESSION_REPORT_KWH: f64 = 0.5;

/// Sleep-over is evaluated from this hour on
const SLEEP_OVER_FROM_HOUR: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InverterMode {
    /// Normal self consumption; the inverter may discharge down to the min SoC
    #[default]
    General,
    /// Charge the battery from the grid
    EcoCharge,
}

impl InverterMode {
    /// Option label the inverter's mode selector uses for this mode
    pub fn option<'a>(&self, options: &'a Options) -> &'a str {
        match self {
            InverterMode::General => &options.mode_option_normal,
            InverterMode::EcoCharge => &options.mode_option_force_charge,
        }
    }
}

impl fmt::Display for InverterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InverterMode::General => write!(f, "general"),
            InverterMode::EcoCharge => write!(f, "eco_charge"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub battery: BatteryConfig,
    pub entities: EntityConfig,
    /// Nominal time between ticks, used when there is no previous tick
    pub poll_interval: Duration,
}

/// Everything the engine remembers between ticks
#[derive(Debug, Clone)]
pub struct EngineState {
    pub is_active: bool,
    pub trackers: EnergyTrackers,
    pub charging_session_active: bool,
    pub charging_session_net_charged_kwh: f64,
    pub last_mode_command_time: Option<DateTime<Tz>>,
    pub last_limit_command_time: Option<DateTime<Tz>>,
    pub last_sleep_over_notified_date: Option<NaiveDate>,
    pub last_tick_time: Option<DateTime<Tz>>,

    pub current_price: f64,
    pub peak_price: f64,
    pub peak_time: Option<DateTime<Tz>>,
    pub next_charge_time: Option<DateTime<Tz>>,
    pub slot_plan: Option<SlotPlan>,
    pub slots_info: String,
    pub recommendation_mode: InverterMode,
    pub status_message: String,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            is_active: true,
            trackers: EnergyTrackers::default(),
            charging_session_active: false,
            charging_session_net_charged_kwh: 0.0,
            last_mode_command_time: None,
            last_limit_command_time: None,
            last_sleep_over_notified_date: None,
            last_tick_time: None,
            current_price: 0.0,
            peak_price: 0.0,
            peak_time: None,
            next_charge_time: None,
            slot_plan: None,
            slots_info: "Keine Slots".to_string(),
            recommendation_mode: InverterMode::General,
            status_message: "Init...".to_string(),
        }
    }
}

/// Sensor values read at the start of a tick
#[derive(Debug, Clone, Default)]
pub struct LiveReadings {
    pub soc: f64,
    pub power: PowerReadings,
    pub avg_consumption_w: f64,
    /// Raw value of the inverter's min SoC entity, if configured and readable
    pub inverter_limit: Option<f64>,
    pub environment: EnvironmentReadings,
}

impl LiveReadings {
    pub async fn collect<B: HomeBridge + ?Sized>(
        bridge: &B,
        entities: &EntityConfig,
        options: &Options,
    ) -> Self {
        let pv_w = read_numeric(bridge, entities.pv_power.as_deref(), 0.0).await;

        let sun_elevation_deg = read_entity(bridge, entities.sun.as_deref())
            .await
            .and_then(|sun| sun.numeric_attribute("elevation"))
            .unwrap_or(0.0);

        Self {
            soc: read_numeric(bridge, entities.soc.as_deref(), 0.0).await,
            power: PowerReadings {
                pv_w,
                house_w: read_numeric(bridge, entities.house_power.as_deref(), 0.0).await,
                grid_w: read_numeric(bridge, entities.grid_power.as_deref(), 0.0).await,
                battery_w: read_numeric(bridge, entities.battery_power.as_deref(), 0.0).await,
            },
            avg_consumption_w: read_numeric(bridge, entities.avg_consumption.as_deref(), 500.0)
                .await,
            inverter_limit: read_optional_numeric(bridge, options.inverter_min_soc_entity.as_deref())
                .await,
            environment: EnvironmentReadings {
                pv_power_w: pv_w,
                forecast_next_hour_kwh: read_numeric(
                    bridge,
                    entities.pv_forecast_next_hour.as_deref(),
                    0.0,
                )
                .await,
                forecast_remaining_kwh: read_numeric(
                    bridge,
                    entities.pv_forecast_remaining.as_deref(),
                    0.0,
                )
                .await,
                sun_elevation_deg,
                weather: read_text(bridge, entities.weather.as_deref()).await,
                pv_peak_time: read_text(bridge, entities.pv_peak_time.as_deref()).await,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    fn sleep_over(min_soc: f64) -> Self {
        Self {
            title: "Sleep-Over 🌙".to_string(),
            message: format!("Reserviere {:.0}% Akku.", min_soc),
        }
    }

    fn charge_start(price: f64) -> Self {
        Self {
            title: "Smart Charge Start 🔋".to_string(),
            message: format!("Preis: {:.3}€", price),
        }
    }

    fn charge_end(kwh: f64) -> Self {
        Self {
            title: "Smart Charge Ende ✅".to_string(),
            message: format!("Geladen: {:.2} kWh", kwh),
        }
    }
}

/// Side effects requested by one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub mode: InverterMode,
    /// Floor pushed to the inverter's min SoC entity
    pub min_soc_target: f64,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    /// Start of the cheapest pool slot, if any
    pub first_slot: Option<DateTime<Tz>>,
    pub now: DateTime<Tz>,
    pub house_w: f64,
    pub avg_consumption_w: f64,
    pub soc: f64,
    pub target_soc: f64,
    pub capacity_kwh: f64,
    pub charger_power_kw: f64,
    pub pv_deduction_kwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeSizing {
    pub load_w: f64,
    pub hours_until_first_slot: f64,
    pub needed_kwh: f64,
    pub slots_needed: usize,
}

/// Grid energy still needed, and how many quarter-hour slots that takes.
pub fn size_charge(input: &SizingInput) -> ChargeSizing {
    let first_slot = input.first_slot.unwrap_or(input.now);
    let hours_until_first_slot = (first_slot - input.now).num_seconds() as f64 / 3600.0;

    // The current draw is only a good predictor for the next hour
    let mut load_w = input.avg_consumption_w;
    if hours_until_first_slot <= 1.0 && input.house_w > 0.0 {
        load_w = input.house_w * 0.7 + input.avg_consumption_w * 0.3;
    }
    let load_w = load_w.clamp(200.0, 1500.0);

    let consumption_kwh = load_w / 1000.0 * hours_until_first_slot.max(0.0);
    let soc_need_kwh = ((input.target_soc - input.soc) / 100.0 * input.capacity_kwh).max(0.0);
    let needed_kwh = (consumption_kwh + soc_need_kwh - input.pv_deduction_kwh)
        .min(input.capacity_kwh)
        .max(0.0);

    let slots_needed = if input.charger_power_kw > 0.0 && needed_kwh > 0.0 {
        ((needed_kwh / input.charger_power_kw * 4.0).ceil() as usize).min(MAX_CHARGE_SLOTS)
    } else {
        0
    };

    ChargeSizing {
        load_w,
        hours_until_first_slot,
        needed_kwh,
        slots_needed,
    }
}

/// Minimum peak/current spread worth holding the battery for. Fuller batteries
/// demand a bigger spread; the base spread is always the floor.
pub fn effective_spread(soc: f64, options: &Options) -> f64 {
    if soc > options.soc_high {
        options.min_spread.max(options.spread_high)
    } else if soc > options.soc_med {
        options.min_spread.max(options.spread_med)
    } else {
        options.min_spread
    }
}

pub struct DecisionEngine {
    config: EngineConfig,
    state: EngineState,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: EngineState::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn set_active(&mut self, active: bool) {
        info!("Automatic control {}", if active { "enabled" } else { "disabled" });
        if active && !self.state.is_active {
            // Nothing was integrated while disabled
            self.state.last_tick_time = None;
        }
        self.state.is_active = active;
    }

    /// Run one polling cycle and return the status to publish.
    pub async fn tick<B: HomeBridge + ?Sized>(
        &mut self,
        bridge: &B,
        prices: &PriceFeed,
        options: &Options,
        now: DateTime<Tz>,
    ) -> String {
        if !self.state.is_active {
            return "Deaktiviert".to_string();
        }

        match self.run_logic(bridge, prices, options, now).await {
            Ok(()) => self.state.status_message.clone(),
            Err(e) => {
                error!("Logic error: {}", e);
                self.state.status_message = format!("Error: {}", e);
                self.state.status_message.clone()
            }
        }
    }

    async fn run_logic<B: HomeBridge + ?Sized>(
        &mut self,
        bridge: &B,
        prices: &PriceFeed,
        options: &Options,
        now: DateTime<Tz>,
    ) -> Result<(), EngineError> {
        if self.config.battery.capacity_kwh <= 0.0 {
            return Err(EngineError::InvalidOptions(format!(
                "battery capacity must be positive, got {}",
                self.config.battery.capacity_kwh
            )));
        }
        options.validate()?;
        debug!(
            "Battery efficiency {:.2}, min profit {:.3}",
            options.battery_efficiency, options.min_profit
        );

        let readings = LiveReadings::collect(bridge, &self.config.entities, options).await;

        let Some(decision) = self.evaluate(&readings, prices, options, now)? else {
            return Ok(());
        };

        self.push_min_soc_limit(bridge, decision.min_soc_target, readings.inverter_limit, options, now)
            .await;
        for notification in &decision.notifications {
            self.send_notification(bridge, options, notification).await;
        }
        self.push_mode(bridge, decision.mode, options, now).await;

        Ok(())
    }

    /// Decide mode, min SoC and slot plan for this tick and update trackers.
    /// Returns `None` when there are no prices to decide on.
    pub fn evaluate(
        &mut self,
        readings: &LiveReadings,
        prices: &PriceFeed,
        options: &Options,
        now: DateTime<Tz>,
    ) -> Result<Option<Decision>, EngineError> {
        let elapsed = integration_interval(
            self.state.last_tick_time.map(|last| now - last),
            self.config.poll_interval,
        );
        self.state.last_tick_time = Some(now);

        let soc = readings.soc;
        let user_min_soc = effective_min_soc(
            readings.inverter_limit,
            options.inverter_min_soc_invert,
            options.min_soc,
        );
        let outlook = SolarOutlook::assess(&readings.environment, now);

        let Some(timeline) = PriceTimeline::build(&prices.today, &prices.tomorrow, now) else {
            warn!("No future prices available");
            self.state.status_message = "Keine Preise".to_string();
            return Ok(None);
        };

        let price = prices.current_price_at(now);
        let peak = timeline.peak();
        self.state.current_price = price;
        self.state.peak_price = peak.price;
        self.state.peak_time = Some(peak.start);

        let charged = self.state.trackers.accrue(
            &readings.power,
            price,
            self.config.battery.reference_price,
            self.state.charging_session_active,
            elapsed,
        );
        self.state.charging_session_net_charged_kwh += charged;

        let hours_to_peak = (peak.start - now).num_seconds() as f64 / 3600.0;
        let panic_mode = hours_to_peak > 0.0
            && hours_to_peak < PANIC_PEAK_HOURS
            && soc < user_min_soc + PANIC_SOC_MARGIN;

        let spread_threshold = effective_spread(soc, options);
        let price_spread = peak.price - price;
        let should_hold = price_spread >= spread_threshold;

        let mut notifications = Vec::new();
        let mut min_soc_target = user_min_soc;
        let mut sleep_over_active = false;

        if now.hour() >= SLEEP_OVER_FROM_HOUR && !prices.tomorrow.is_empty() {
            if let Some(morning_peak) = timeline.morning_peak_tomorrow(now) {
                if morning_peak - price > options.morning_diff {
                    min_soc_target = options.sleep_soc;
                    sleep_over_active = true;
                    let today = now.date_naive();
                    if self.state.last_sleep_over_notified_date != Some(today) {
                        notifications.push(Notification::sleep_over(min_soc_target));
                        self.state.last_sleep_over_notified_date = Some(today);
                    }
                }
            }
        }
        let effective_min_soc = min_soc_target;

        let deadline = timeline.charge_deadline(now)?;
        let pool = timeline.cheap_pool(deadline);
        let sizing = size_charge(&SizingInput {
            first_slot: pool.first().map(|s| s.start),
            now,
            house_w: readings.power.house_w,
            avg_consumption_w: readings.avg_consumption_w,
            soc,
            target_soc: options.target_soc,
            capacity_kwh: self.config.battery.capacity_kwh,
            charger_power_kw: self.config.battery.charger_power_kw,
            pv_deduction_kwh: pv_deduction(
                readings.environment.forecast_remaining_kwh,
                options.pv_safety_factor,
            ),
        });

        let plan = SlotPlan::select(&pool, sizing.slots_needed);
        match &plan {
            Some(plan) => {
                self.state.slots_info = plan.to_string();
                self.state.next_charge_time = Some(plan.first_start());
            }
            None => {
                self.state.slots_info = "Keine Slots nötig".to_string();
                self.state.next_charge_time = None;
            }
        }
        let is_cheap_now = plan.as_ref().is_some_and(|p| p.contains(now));
        self.state.slot_plan = plan;

        debug!(
            "Spread {:.3} (threshold {:.3}), deadline {}, pool {}, load {:.0}W for {:.2}h, need {:.2}kWh in {} slots, cheap now: {}",
            price_spread,
            spread_threshold,
            deadline.format("%H:%M"),
            pool.len(),
            sizing.load_w,
            sizing.hours_until_first_slot,
            sizing.needed_kwh,
            sizing.slots_needed,
            is_cheap_now
        );
        debug!(
            "Sun: shining={} (pv={}, daylight={}, weather={:.2}, forecast={}, pv peak={})",
            outlook.is_sun_shining,
            outlook.pv_active,
            outlook.is_daylight,
            outlook.weather_factor,
            outlook.forecast_strong,
            outlook.approaching_peak
        );

        let (mode, message) = if panic_mode {
            self.start_session();
            (
                InverterMode::EcoCharge,
                format!("PANIK! SoC < {:.0}%. Peak bald.", user_min_soc + PANIC_SOC_MARGIN),
            )
        } else if price > HIGH_PRICE_THRESHOLD || (price_spread < spread_threshold && !is_cheap_now) {
            // Expensive now: let the battery carry the house unless sun or a bigger peak is coming
            let message = if outlook.is_sun_shining {
                "Warten (PV/Peak erwartet).".to_string()
            } else if should_hold && price > HIGH_PRICE_THRESHOLD {
                format!("Warten (Peak erwartet: {:.3}€)", peak.price)
            } else if soc > effective_min_soc {
                if price > HIGH_PRICE_THRESHOLD {
                    format!("Entladen (Preis: {:.3}€)", price)
                } else {
                    "Entladen (Spread zu klein).".to_string()
                }
            } else {
                format!("Reserve erreicht ({:.0}%).", effective_min_soc)
            };
            (InverterMode::General, message)
        } else if is_cheap_now && soc < options.target_soc && sizing.needed_kwh > 0.1 {
            if self.start_session() {
                notifications.push(Notification::charge_start(price));
            }
            (
                InverterMode::EcoCharge,
                format!("Laden bis {:.0}% ({:.3}€)", options.target_soc, price),
            )
        } else {
            let message = if sleep_over_active {
                format!("Warten (Sleep-Over {:.0}%)", effective_min_soc)
            } else if should_hold {
                "Warten (Spread/Hold)".to_string()
            } else if outlook.is_sun_shining {
                "Warten (PV/Peak erwartet)".to_string()
            } else {
                "Warten (Standardbetrieb).".to_string()
            };

            if self.state.charging_session_active {
                self.state.charging_session_active = false;
                let total = self.state.charging_session_net_charged_kwh;
                info!("Charging session ended after {:.2} kWh", total);
                if total > SESSION_REPORT_KWH {
                    notifications.push(Notification::charge_end(total));
                }
            }
            (InverterMode::General, message)
        };

        info!(
            "Decision: mode={}, soc={:.1}%, price={:.3}, peak={:.3}, min_soc={:.0}% - {}",
            mode, soc, price, peak.price, effective_min_soc, message
        );

        self.state.recommendation_mode = mode;
        self.state.status_message = message;

        Ok(Some(Decision {
            mode,
            min_soc_target,
            notifications,
        }))
    }

    /// Returns true if a new session was started
    fn start_session(&mut self) -> bool {
        if self.state.charging_session_active {
            return false;
        }
        info!("Charging session started");
        self.state.charging_session_active = true;
        self.state.charging_session_net_charged_kwh = 0.0;
        true
    }

    async fn push_min_soc_limit<B: HomeBridge + ?Sized>(
        &mut self,
        bridge: &B,
        min_soc: f64,
        reported: Option<f64>,
        options: &Options,
        now: DateTime<Tz>,
    ) {
        let Some(entity) = options.inverter_min_soc_entity.as_deref() else {
            return;
        };

        let target = if options.inverter_min_soc_invert {
            100.0 - min_soc
        } else {
            min_soc
        };
        let target = target.clamp(0.0, 100.0) as u8;

        if (reported.unwrap_or(-1.0) - f64::from(target)).abs() <= 1.0 {
            debug!("Inverter limit {} already at {}", entity, target);
            return;
        }

        match bridge.set_numeric(entity, target).await {
            Ok(()) => {
                info!("Set inverter limit {} to {}", entity, target);
                self.state.last_limit_command_time = Some(now);
            }
            Err(e) => warn!("Failed to set inverter limit {}: {}", entity, e),
        }
    }

    async fn push_mode<B: HomeBridge + ?Sized>(
        &mut self,
        bridge: &B,
        mode: InverterMode,
        options: &Options,
        now: DateTime<Tz>,
    ) {
        let Some(entity) = self.config.entities.inverter_mode.as_deref() else {
            return;
        };
        let option = mode.option(options);

        if let Some(last) = self.state.last_mode_command_time {
            if (now - last).num_seconds() < MODE_DEBOUNCE_SECS {
                let reported = read_text(bridge, Some(entity)).await;
                if reported.as_deref() == Some(option) {
                    debug!("Inverter already in '{}', command suppressed", option);
                    return;
                }
            }
        }

        match bridge.set_mode(entity, option).await {
            Ok(()) => {
                debug!("Sent inverter mode '{}' to {}", option, entity);
                self.state.last_mode_command_time = Some(now);
            }
            Err(e) => warn!("Failed to set inverter mode {}: {}", entity, e),
        }
    }

    async fn send_notification<B: HomeBridge + ?Sized>(
        &self,
        bridge: &B,
        options: &Options,
        notification: &Notification,
    ) {
        if !options.notify_active {
            return;
        }
        let Some(service) = options.notify_service.as_deref() else {
            return;
        };
        if let Err(e) = bridge
            .notify(service, &notification.title, &notification.message)
            .await
        {
            warn!("Failed to send notification '{}': {}", notification.title, e);
        }
    }
}
