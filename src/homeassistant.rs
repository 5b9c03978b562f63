use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::bridge::{EntityState, HomeBridge};
use crate::config::HomeAssistantConfig;
use crate::errors::{BridgeError, BridgeResult};

/// Home Assistant REST API client
#[derive(Clone)]
pub struct HomeAssistantClient {
    base_url: String,
    token: String,
    client: Client,
}

impl HomeAssistantClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    /// Configured token first, then the Supervisor token injected into addons
    pub fn from_config(config: &HomeAssistantConfig) -> BridgeResult<Self> {
        let token = config
            .token
            .clone()
            .or_else(|| std::env::var("SUPERVISOR_TOKEN").ok())
            .ok_or_else(|| {
                BridgeError::Config(
                    "No Home Assistant token configured and SUPERVISOR_TOKEN not set".to_string(),
                )
            })?;

        info!("Initializing Home Assistant client: {}", config.base_url);
        Self::new(config.base_url.clone(), token)
    }

    pub async fn get_state(&self, entity_id: &str) -> BridgeResult<Option<EntityState>> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        debug!("Getting state for entity: {}", entity_id);

        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<EntityState>().await?)),
            StatusCode::NOT_FOUND => {
                debug!("Entity not found: {}", entity_id);
                Ok(None)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BridgeError::AuthenticationFailed),
            status => Err(BridgeError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Call a service given as "domain.service"
    pub async fn call_service(&self, service: &str, data: Value) -> BridgeResult<()> {
        let Some((domain, name)) = service.split_once('.') else {
            return Err(BridgeError::ServiceCallFailed {
                service: service.to_string(),
                reason: "Invalid service format, expected 'domain.service'".to_string(),
            });
        };

        let url = format!("{}/api/services/{}/{}", self.base_url, domain, name);
        debug!("Calling service {} with {}", service, data);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BridgeError::AuthenticationFailed);
        }

        let reason = response.text().await.unwrap_or_default();
        error!("Service {} failed (status: {}): {}", service, status, reason);
        Err(BridgeError::ServiceCallFailed {
            service: service.to_string(),
            reason,
        })
    }
}

/// Helpers (input_select, input_number) live in their own service domains
fn entity_domain<'a>(entity_id: &str, fallback: &'a str, helper: &'a str) -> &'a str {
    if entity_id.starts_with(helper) {
        helper
    } else {
        fallback
    }
}

/// "mobile_app_phone" means "notify.mobile_app_phone"
fn notify_service(service: &str) -> String {
    if service.contains('.') {
        service.to_string()
    } else {
        format!("notify.{}", service)
    }
}

#[async_trait]
impl HomeBridge for HomeAssistantClient {
    async fn entity_state(&self, entity_id: &str) -> BridgeResult<Option<EntityState>> {
        self.get_state(entity_id).await
    }

    async fn set_mode(&self, entity_id: &str, option: &str) -> BridgeResult<()> {
        let domain = entity_domain(entity_id, "select", "input_select");
        self.call_service(
            &format!("{}.select_option", domain),
            json!({ "entity_id": entity_id, "option": option }),
        )
        .await
    }

    async fn set_numeric(&self, entity_id: &str, value: u8) -> BridgeResult<()> {
        let domain = entity_domain(entity_id, "number", "input_number");
        self.call_service(
            &format!("{}.set_value", domain),
            json!({ "entity_id": entity_id, "value": value }),
        )
        .await
    }

    async fn notify(&self, service: &str, title: &str, message: &str) -> BridgeResult<()> {
        self.call_service(
            &notify_service(service),
            json!({ "title": title, "message": message }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_get_state_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/sensor.battery_soc")
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "entity_id": "sensor.battery_soc",
                    "state": "42.5",
                    "attributes": {},
                    "last_changed": "2025-10-02T10:00:00Z",
                    "last_updated": "2025-10-02T10:00:00Z"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        let state = client.get_state("sensor.battery_soc").await.unwrap().unwrap();

        assert_eq!(state.numeric(), Some(42.5));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_state_not_found_is_none() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/sensor.gone")
            .with_status(404)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        assert!(client.get_state("sensor.gone").await.unwrap().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_state_unauthorized() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states/sensor.x")
            .with_status(401)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "bad").unwrap();
        let result = client.get_state("sensor.x").await;
        assert!(matches!(result, Err(BridgeError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_set_mode_uses_select_domain() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/services/select/select_option")
            .match_body(Matcher::Json(json!({
                "entity_id": "select.inverter_mode",
                "option": "eco_charge"
            })))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        client.set_mode("select.inverter_mode", "eco_charge").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_set_mode_input_select_and_numeric() {
        let mut server = Server::new_async().await;
        let select = server
            .mock("POST", "/api/services/input_select/select_option")
            .with_status(200)
            .create_async()
            .await;
        let number = server
            .mock("POST", "/api/services/input_number/set_value")
            .match_body(Matcher::Json(json!({
                "entity_id": "input_number.min_soc",
                "value": 15
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        client.set_mode("input_select.mode", "general").await.unwrap();
        client.set_numeric("input_number.min_soc", 15).await.unwrap();
        select.assert_async().await;
        number.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_bare_service_name() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/services/notify/mobile_app_phone")
            .match_body(Matcher::Json(json!({ "title": "T", "message": "M" })))
            .with_status(200)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        client.notify("mobile_app_phone", "T", "M").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_service_failure_is_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/services/number/set_value")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        let result = client.set_numeric("number.min_soc", 10).await;
        assert!(matches!(result, Err(BridgeError::ServiceCallFailed { .. })));
    }

    #[tokio::test]
    async fn test_call_service_invalid_format() {
        let client = HomeAssistantClient::new("http://localhost", "token").unwrap();
        let result = client.call_service("invalid", json!({})).await;
        assert!(matches!(result, Err(BridgeError::ServiceCallFailed { .. })));
    }
}
