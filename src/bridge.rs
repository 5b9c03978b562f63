use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::BridgeResult;

/// Placeholder states Home Assistant reports instead of a value
const UNAVAILABLE_STATES: [&str; 2] = ["unavailable", "unknown"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl EntityState {
    pub fn is_available(&self) -> bool {
        !UNAVAILABLE_STATES.contains(&self.state.as_str())
    }

    /// Numeric state, `None` for placeholder or non-numeric states
    pub fn numeric(&self) -> Option<f64> {
        if !self.is_available() {
            return None;
        }
        self.state.trim().parse::<f64>().ok()
    }

    pub fn numeric_attribute(&self, name: &str) -> Option<f64> {
        match self.attributes.get(name)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Everything the engine reads from and commands on the host platform
#[async_trait]
pub trait HomeBridge: Send + Sync {
    /// Current state of an entity, `None` if it does not exist
    async fn entity_state(&self, entity_id: &str) -> BridgeResult<Option<EntityState>>;

    /// Select an option on a mode selector entity
    async fn set_mode(&self, entity_id: &str, option: &str) -> BridgeResult<()>;

    /// Set a numeric entity (0..=100)
    async fn set_numeric(&self, entity_id: &str, value: u8) -> BridgeResult<()>;

    /// Push a notification through `service` ("notify.x" or just "x")
    async fn notify(&self, service: &str, title: &str, message: &str) -> BridgeResult<()>;
}

/// Fetch an entity, treating lookup failures as a missing entity
pub async fn read_entity<B: HomeBridge + ?Sized>(
    bridge: &B,
    entity_id: Option<&str>,
) -> Option<EntityState> {
    let entity_id = entity_id?;
    match bridge.entity_state(entity_id).await {
        Ok(state) => state,
        Err(e) => {
            warn!("Failed to read {}: {}", entity_id, e);
            None
        }
    }
}

/// Numeric entity state, or `None` if unset, missing, unavailable or not a number
pub async fn read_optional_numeric<B: HomeBridge + ?Sized>(
    bridge: &B,
    entity_id: Option<&str>,
) -> Option<f64> {
    read_entity(bridge, entity_id).await?.numeric()
}

pub async fn read_numeric<B: HomeBridge + ?Sized>(
    bridge: &B,
    entity_id: Option<&str>,
    default: f64,
) -> f64 {
    read_optional_numeric(bridge, entity_id).await.unwrap_or(default)
}

/// Available text state of an entity
pub async fn read_text<B: HomeBridge + ?Sized>(bridge: &B, entity_id: Option<&str>) -> Option<String> {
    read_entity(bridge, entity_id)
        .await
        .filter(EntityState::is_available)
        .map(|s| s.state)
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use crate::errors::BridgeError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Command {
        SetMode { entity_id: String, option: String },
        SetNumeric { entity_id: String, value: u8 },
        Notify { title: String, message: String },
    }

    /// In-memory bridge that records every command it receives
    #[derive(Default)]
    pub struct FakeBridge {
        states: Mutex<HashMap<String, EntityState>>,
        commands: Mutex<Vec<Command>>,
        failing: Mutex<bool>,
    }

    impl FakeBridge {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_state(&self, entity_id: &str, state: impl ToString) {
            self.set_state_with_attributes(entity_id, state, serde_json::Value::Null);
        }

        pub fn set_state_with_attributes(
            &self,
            entity_id: &str,
            state: impl ToString,
            attributes: serde_json::Value,
        ) {
            self.states.lock().unwrap().insert(
                entity_id.to_string(),
                EntityState {
                    entity_id: entity_id.to_string(),
                    state: state.to_string(),
                    attributes,
                },
            );
        }

        /// Make every call fail with a transport error
        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        pub fn commands(&self) -> Vec<Command> {
            self.commands.lock().unwrap().clone()
        }

        pub fn clear_commands(&self) {
            self.commands.lock().unwrap().clear();
        }

        pub fn mode_commands(&self) -> Vec<String> {
            self.commands()
                .into_iter()
                .filter_map(|c| match c {
                    Command::SetMode { option, .. } => Some(option),
                    _ => None,
                })
                .collect()
        }

        pub fn notifications(&self) -> Vec<String> {
            self.commands()
                .into_iter()
                .filter_map(|c| match c {
                    Command::Notify { title, .. } => Some(title),
                    _ => None,
                })
                .collect()
        }

        fn check(&self) -> BridgeResult<()> {
            if *self.failing.lock().unwrap() {
                return Err(BridgeError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl HomeBridge for FakeBridge {
        async fn entity_state(&self, entity_id: &str) -> BridgeResult<Option<EntityState>> {
            self.check()?;
            Ok(self.states.lock().unwrap().get(entity_id).cloned())
        }

        async fn set_mode(&self, entity_id: &str, option: &str) -> BridgeResult<()> {
            self.check()?;
            self.commands.lock().unwrap().push(Command::SetMode {
                entity_id: entity_id.to_string(),
                option: option.to_string(),
            });
            Ok(())
        }

        async fn set_numeric(&self, entity_id: &str, value: u8) -> BridgeResult<()> {
            self.check()?;
            self.commands.lock().unwrap().push(Command::SetNumeric {
                entity_id: entity_id.to_string(),
                value,
            });
            Ok(())
        }

        async fn notify(&self, _service: &str, title: &str, message: &str) -> BridgeResult<()> {
            self.check()?;
            self.commands.lock().unwrap().push(Command::Notify {
                title: title.to_string(),
                message: message.to_string(),
            });
            Ok(())
        }
    }
}
