//! Broker endpoints and per-game profiles
//!
//! Profiles are loaded once at startup (one JSON document per game) and are
//! read-only afterwards. The registry hands out endpoint lists already sorted
//! by ascending `priority`, which is the order connections try them in.

use crate::errors::{ConfigurationError, LinkResult};
use crate::games::GameKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// TLS settings for one broker endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    /// PEM bundle used to verify the broker. Platform roots when absent.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

/// One broker's network address and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEndpoint {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Lower values are tried first
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_keep_alive() -> u64 {
    60
}

impl BrokerEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            username: String::new(),
            password: String::new(),
            priority: 0,
            keep_alive_seconds: default_keep_alive(),
            tls: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// `host:port`, the key connections are indexed by in the pool
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Everything a game controller needs to talk to its detection backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameProfile {
    pub client_id_prefix: String,
    pub game_code: String,
    /// Explicit game family; inferred from `game_code` when absent
    #[serde(default)]
    pub game_type: Option<GameKind>,
    pub command_topic: String,
    pub response_topic: String,
    #[serde(default)]
    pub shaker_topic: Option<String>,
    #[serde(default)]
    pub status_topic: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub endpoints: Vec<BrokerEndpoint>,
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

impl GameProfile {
    /// Check the profile invariants: at least one endpoint, non-empty topics
    pub fn validate(&self) -> LinkResult<()> {
        if self.game_code.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired("gameCode".to_string()).into());
        }
        if self.command_topic.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired("commandTopic".to_string()).into());
        }
        if self.response_topic.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired("responseTopic".to_string()).into());
        }
        if self.endpoints.is_empty() {
            return Err(ConfigurationError::ValidationFailed(format!(
                "game '{}' has no broker endpoints",
                self.game_code
            ))
            .into());
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "timeoutSeconds".to_string(),
                value: "0".to_string(),
                reason: "Timeout cannot be zero".to_string(),
            }
            .into());
        }
        for endpoint in &self.endpoints {
            if endpoint.address.trim().is_empty() {
                return Err(ConfigurationError::MissingRequired("endpoints[].address".to_string()).into());
            }
            if endpoint.port == 0 {
                return Err(ConfigurationError::InvalidValue {
                    field: "endpoints[].port".to_string(),
                    value: "0".to_string(),
                    reason: "Port cannot be zero".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// The game family this profile drives
    pub fn game_kind(&self) -> LinkResult<GameKind> {
        if let Some(kind) = self.game_type {
            return Ok(kind);
        }
        GameKind::infer(&self.game_code).ok_or_else(|| {
            ConfigurationError::InvalidValue {
                field: "gameType".to_string(),
                value: self.game_code.clone(),
                reason: "Cannot infer game type from game code".to_string(),
            }
            .into()
        })
    }

    /// Endpoints in the order they should be tried
    pub fn ordered_endpoints(&self) -> Vec<BrokerEndpoint> {
        let mut endpoints = self.endpoints.clone();
        endpoints.sort_by_key(|e| e.priority);
        endpoints
    }

    /// Client id for the n-th connection of this game
    pub fn client_id(&self, suffix: &str) -> String {
        format!("{}_{}_{}", self.client_id_prefix, self.game_code, suffix)
    }

    /// Tags carried by this game's pooled connections
    pub fn pool_tags(&self) -> Vec<String> {
        let mut tags = vec![self.game_code.clone()];
        if let Ok(kind) = self.game_kind() {
            tags.push(kind.to_string());
        }
        tags
    }

    /// Topics every connection for this game listens on
    pub fn inbound_topics(&self) -> Vec<String> {
        let mut topics = vec![self.response_topic.clone()];
        if let Some(ref t) = self.shaker_topic {
            topics.push(t.clone());
        }
        if let Some(ref t) = self.status_topic {
            topics.push(t.clone());
        }
        topics
    }
}

/// Game profiles keyed by game code
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    profiles: HashMap<String, GameProfile>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a profile, replacing any previous one for the game
    pub fn register(&mut self, profile: GameProfile) -> LinkResult<()> {
        profile.validate()?;
        debug!(
            "Registered game {} with {} endpoint(s)",
            profile.game_code,
            profile.endpoints.len()
        );
        self.profiles.insert(profile.game_code.clone(), profile);
        Ok(())
    }

    /// Parse a single profile document
    pub fn profile_from_json_str(json: &str) -> LinkResult<GameProfile> {
        let profile: GameProfile = serde_json::from_str(json)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load one profile document from disk and register it
    pub fn load_profile_json<P: AsRef<Path>>(&mut self, path: P) -> LinkResult<String> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let profile = Self::profile_from_json_str(&content)?;
        let code = profile.game_code.clone();
        self.register(profile)?;
        info!("Loaded game profile {} from {}", code, path.display());
        Ok(code)
    }

    /// Load every `*.json` profile in a directory
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> LinkResult<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                self.load_profile_json(&path)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, game_code: &str) -> Option<&GameProfile> {
        self.profiles.get(game_code)
    }

    /// Endpoints for a game sorted by ascending priority (empty if unknown)
    pub fn ordered_endpoints(&self, game_code: &str) -> Vec<BrokerEndpoint> {
        self.profiles
            .get(game_code)
            .map(|p| p.ordered_endpoints())
            .unwrap_or_default()
    }

    pub fn games(&self) -> Vec<String> {
        let mut games: Vec<String> = self.profiles.keys().cloned().collect();
        games.sort();
        games
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
