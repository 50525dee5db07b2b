use std::{
    collections::HashMap,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::debug;

use super::BridgeError;
use crate::{
    anki::{
        api::{
            ANKI_CONNECT_URL,
            PROBE_TIMEOUT,
        },
        retry::RetryPolicy,
        types::DEFAULT_TEMPLATE,
    },
    persistence,
};

pub const CONFIG_FILE: &str = "config.json";
pub const ENV_PREFIX: &str = "ANKIBRIDGE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub endpoint: String,
    pub probe_timeout_ms: u64,
    pub retry: RetrySettings,
    pub deck_name: String,
    pub template_name: String,
    pub tags: Vec<String>,
    pub allow_duplicates: bool,
    /// Note type field name to the text it gets on every imported note.
    pub field_overrides: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: ANKI_CONNECT_URL.to_string(),
            probe_timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
            retry: RetrySettings::default(),
            deck_name: "Default".to_string(),
            template_name: DEFAULT_TEMPLATE.to_string(),
            tags: Vec::new(),
            allow_duplicates: false,
            field_overrides: HashMap::new(),
        }
    }
}

/// Serializable form of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub attempt_timeout_ms: u64,
    pub timeout_escalation_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let standard = RetryPolicy::standard();
        Self {
            max_attempts: standard.max_attempts(),
            base_delay_ms: standard.base_delay.as_millis() as u64,
            backoff_factor: standard.backoff_factor,
            attempt_timeout_ms: standard.per_attempt_timeout.as_millis() as u64,
            timeout_escalation_ms: standard.timeout_escalation.as_millis() as u64,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy, BridgeError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(BridgeError::InvalidPolicy(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(BridgeError::InvalidPolicy("attempt_timeout_ms must be positive".to_string()));
        }

        let mut policy = RetryPolicy::standard();
        policy.base_delay = Duration::from_millis(self.base_delay_ms);
        policy.backoff_factor = self.backoff_factor;
        policy.per_attempt_timeout = Duration::from_millis(self.attempt_timeout_ms);
        policy.timeout_escalation = Duration::from_millis(self.timeout_escalation_ms);
        if !self.jitter {
            policy = policy.without_jitter();
        }
        policy.with_max_attempts(self.max_attempts)
    }
}

impl BridgeConfig {
    pub fn default_path() -> PathBuf {
        persistence::get_data_file_path(CONFIG_FILE)
    }

    /// Reads `path` (or the per-user config file), then applies `ANKIBRIDGE_*`
    /// environment variables. Only the per-user file may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, BridgeError> {
        let config: BridgeConfig = match path {
            Some(path) if !path.exists() => {
                return Err(BridgeError::Config(format!("{} does not exist", path.display())));
            }
            Some(path) => persistence::load_json(path)?,
            None => persistence::load_json(&Self::default_path())?,
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn save(&self, path: &Path) -> Result<(), BridgeError> {
        persistence::save_json(self, path)
    }

    /// `lookup` receives full variable names, e.g. `ANKIBRIDGE_DECK`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BridgeError> {
        let var = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).filter(|value| !value.trim().is_empty()).map(|value| (key, value))
        };

        if let Some((_, endpoint)) = var("ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some((key, value)) = var("PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = parse_var(&key, &value)?;
        }
        if let Some((key, value)) = var("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var(&key, &value)?;
        }
        if let Some((_, deck)) = var("DECK") {
            self.deck_name = deck;
        }
        if let Some((_, template)) = var("TEMPLATE") {
            self.template_name = template;
        }
        if let Some((_, tags)) = var("TAGS") {
            self.tags = tags
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some((key, value)) = var("ALLOW_DUPLICATES") {
            self.allow_duplicates = parse_var(&key, &value)?;
        }

        debug!(endpoint = %self.endpoint, deck = %self.deck_name, template = %self.template_name, "configuration resolved");
        Ok(self)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Parses `NAME=VALUE`. The value may be empty, the name may not.
pub fn parse_field_override(text: &str) -> Result<(String, String), String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", text))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("field name missing in '{}'", text));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_var<V: FromStr>(key: &str, value: &str) -> Result<V, BridgeError> {
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::Config(format!("{} has an invalid value: '{}'", key, value)))
}
