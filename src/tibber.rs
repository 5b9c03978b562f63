use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::TibberConfig;
use crate::timeline::{PricePoint, SLOT_MINUTES};

const GRAPHQL_QUERY: &str = r#"
{
  viewer {
    homes {
      currentSubscription {
        priceInfo(resolution: QUARTER_HOURLY) {
          current {
            total
            startsAt
          }
          today {
            total
            startsAt
          }
          tomorrow {
            total
            startsAt
          }
        }
      }
    }
  }
}
"#;

/// One price fetch: the API's current price plus today's and tomorrow's curves
#[derive(Debug, Clone, Default)]
pub struct PriceFeed {
    pub current_price: Option<f64>,
    pub today: Vec<PricePoint>,
    pub tomorrow: Vec<PricePoint>,
}

impl PriceFeed {
    /// Price of the slot containing `now`, falling back to the API's current price
    pub fn current_price_at(&self, now: DateTime<Tz>) -> f64 {
        let now = now.with_timezone(&Utc);
        self.today
            .iter()
            .chain(self.tomorrow.iter())
            .find(|p| {
                let slot_start = p.timestamp.with_timezone(&Utc);
                now >= slot_start && now < slot_start + chrono::Duration::minutes(SLOT_MINUTES)
            })
            .map(|p| p.price)
            .or(self.current_price)
            .unwrap_or(0.0)
    }
}

/// Last successfully fetched prices. Kept when a refresh fails.
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    pub feed: PriceFeed,
    pub last_fetch: Option<DateTime<Utc>>,
    /// Last fetch attempt, successful or not
    pub last_attempt: Option<DateTime<Utc>>,
}

impl PriceCache {
    /// Refresh when nothing is cached yet or the refresh interval has passed
    /// since the last attempt. A failed attempt waits for the next window.
    pub fn needs_refresh(&self, now: DateTime<Utc>, refresh_interval_secs: u64) -> bool {
        if self.feed.today.is_empty() {
            return true;
        }
        match self.last_attempt {
            None => true,
            Some(last_attempt) => {
                let elapsed = now.signed_duration_since(last_attempt);
                elapsed.num_seconds() >= refresh_interval_secs as i64
            }
        }
    }

    pub fn update(&mut self, feed: PriceFeed, now: DateTime<Utc>) {
        self.feed = feed;
        self.last_fetch = Some(now);
        self.last_attempt = Some(now);
    }

    /// Keep the stale feed but hold off until the next refresh window
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_attempt = Some(now);
    }
}

// API Response structures
#[derive(Debug, Deserialize)]
struct ApiResponse {
    data: ApiData,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    homes: Vec<Home>,
}

#[derive(Debug, Deserialize)]
struct Home {
    #[serde(rename = "currentSubscription")]
    current_subscription: Option<Subscription>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(rename = "priceInfo")]
    price_info: PriceInfo,
}

#[derive(Debug, Deserialize)]
struct PriceInfo {
    current: Option<ApiPrice>,
    #[serde(default)]
    today: Vec<ApiPrice>,
    #[serde(default)]
    tomorrow: Vec<ApiPrice>,
}

#[derive(Debug, Deserialize)]
struct ApiPrice {
    total: f64,
    #[serde(rename = "startsAt")]
    starts_at: DateTime<FixedOffset>,
}

impl From<ApiPrice> for PricePoint {
    fn from(p: ApiPrice) -> Self {
        PricePoint {
            timestamp: p.starts_at,
            price: p.total,
        }
    }
}

pub struct TibberClient {
    config: TibberConfig,
    http_client: reqwest::Client,
}

impl TibberClient {
    pub fn new(config: TibberConfig) -> Self {
        let http_client = reqwest::Client::new();
        Self {
            config,
            http_client,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_token.is_empty()
    }

    pub fn refresh_interval_secs(&self) -> u64 {
        self.config.refresh_interval_secs
    }

    pub async fn fetch_prices(&self) -> Result<PriceFeed> {
        info!("Fetching prices from Tibber API");

        let response = self
            .http_client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "query": GRAPHQL_QUERY
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Tibber API error: {} - {}", status, body);
        }

        let api_response: ApiResponse = response.json().await?;

        // Get first home's subscription
        let home = api_response
            .data
            .viewer
            .homes
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No homes found in Tibber account"))?;

        let subscription = home
            .current_subscription
            .ok_or_else(|| anyhow::anyhow!("No active subscription found"))?;

        let price_info = subscription.price_info;
        let feed = PriceFeed {
            current_price: price_info.current.map(|p| p.total),
            today: price_info.today.into_iter().map(PricePoint::from).collect(),
            tomorrow: price_info.tomorrow.into_iter().map(PricePoint::from).collect(),
        };

        info!(
            "Fetched {} today prices, {} tomorrow prices",
            feed.today.len(),
            feed.tomorrow.len()
        );

        if feed.tomorrow.is_empty() {
            debug!("Tomorrow's prices not yet available (usually published after 13:00)");
        }

        Ok(feed)
    }
}
