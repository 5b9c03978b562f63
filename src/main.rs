use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use smart_price_charge::config::{load_live_options, Config, Options};
use smart_price_charge::engine::{DecisionEngine, EngineConfig};
use smart_price_charge::homeassistant::HomeAssistantClient;
use smart_price_charge::mqtt::{ControlCommand, MqttClient, StateSnapshot};
use smart_price_charge::tibber::{PriceCache, TibberClient};

struct Runtime {
    config: Config,
    tz: chrono_tz::Tz,
    tibber: TibberClient,
    home_assistant: HomeAssistantClient,
    mqtt: MqttClient,
    engine: DecisionEngine,
    prices: PriceCache,
}

impl Runtime {
    async fn refresh_prices(&mut self) {
        if !self.tibber.is_configured() {
            return;
        }
        let now = Utc::now();
        if !self.prices.needs_refresh(now, self.tibber.refresh_interval_secs()) {
            return;
        }
        match self.tibber.fetch_prices().await {
            Ok(feed) => self.prices.update(feed, now),
            Err(e) => {
                // Keep deciding on the stale prices until the next window
                warn!("Failed to refresh prices: {}", e);
                self.prices.record_failure(now);
            }
        }
    }

    async fn run_cycle(&mut self) {
        self.refresh_prices().await;

        let live = load_live_options(self.config.options_path.as_deref());
        let options = Options::resolve(&live, &self.config.settings);

        let now = Utc::now().with_timezone(&self.tz);
        let status = self
            .engine
            .tick(&self.home_assistant, &self.prices.feed, &options, now)
            .await;

        let state = self.engine.state();
        info!(
            "Cycle done: mode={}, price={:.3} EUR, peak={:.3} EUR, slots={} - {}",
            state.recommendation_mode, state.current_price, state.peak_price, state.slots_info, status
        );

        self.publish(&status).await;
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetActive(active) => {
                self.engine.set_active(active);
                let status = if active {
                    self.engine.state().status_message.clone()
                } else {
                    "Deaktiviert".to_string()
                };
                self.publish(&status).await;
            }
            ControlCommand::Refresh => {
                info!("Refresh requested");
                self.run_cycle().await;
            }
        }
    }

    async fn publish(&self, status: &str) {
        let snapshot = StateSnapshot::capture(self.engine.state(), status);
        if let Err(e) = self.mqtt.publish_snapshot(&snapshot).await {
            error!("Failed to publish state: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smart_price_charge=info".parse()?)
                .add_directive("rumqttc=warn".parse()?),
        )
        .init();

    info!("Smart Price Charge starting up");

    // Load configuration
    let config = Config::load_from_env_or_file()?;
    let tz = config.timezone()?;
    info!("Configuration loaded successfully (timezone {})", tz);

    let startup_options =
        Options::resolve(&load_live_options(config.options_path.as_deref()), &config.settings);
    if let Err(e) = startup_options.validate() {
        warn!("{}; cycles will report errors until fixed", e);
    }

    // Initialize components
    let (control_tx, mut control_rx) = mpsc::channel(16);
    let tibber = TibberClient::new(config.tibber.clone());
    if !tibber.is_configured() {
        warn!("No Tibber API token configured, running without prices");
    }
    let home_assistant = HomeAssistantClient::from_config(&config.home_assistant)?;
    let mqtt = MqttClient::new(config.mqtt.clone(), control_tx).await?;
    let engine = DecisionEngine::new(EngineConfig {
        battery: config.battery.clone(),
        entities: config.entities.clone(),
        poll_interval: chrono::Duration::seconds(config.poll_interval_secs as i64),
    });

    let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
    let mut runtime = Runtime {
        config,
        tz,
        tibber,
        home_assistant,
        mqtt,
        engine,
        prices: PriceCache::default(),
    };

    // Main loop - first tick fires immediately
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => runtime.run_cycle().await,
            Some(command) = control_rx.recv() => runtime.handle_command(command).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}
