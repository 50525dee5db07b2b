use serde::Serialize;
use tracing::{
    info,
    warn,
};

use super::api::{
    AnkiClient,
    ApiResponse,
    RpcCall,
    PROTOCOL_VERSION,
};
use crate::core::{
    clock::Clock,
    http::Transport,
    BridgeError,
};

/// What `ankibridge status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub peer_running: bool,
    pub add_on_available: bool,
    pub version: Option<u32>,
    pub valid_version: bool,
    pub templates_available: bool,
    pub decks_available: bool,
    pub error_details: Option<String>,
    pub message: String,
}

impl ConnectionStatus {
    pub fn is_ready(&self) -> bool {
        self.peer_running
            && self.add_on_available
            && self.valid_version
            && self.templates_available
            && self.decks_available
    }

    fn offline(running: bool, add_on: bool, err: &BridgeError, message: &str) -> Self {
        Self {
            peer_running: running,
            add_on_available: add_on,
            version: None,
            valid_version: false,
            templates_available: false,
            decks_available: false,
            error_details: Some(err.to_string()),
            message: message.to_string(),
        }
    }
}

impl<T: Transport, C: Clock> AnkiClient<T, C> {
    /// Checks, step by step, whether an import could work right now.
    pub async fn connection_status(&self) -> ConnectionStatus {
        let version = match self.read_version().await {
            Ok(version) => version,
            Err(err @ BridgeError::Protocol { .. }) => {
                warn!(error = %err, "AnkiConnect answered version with an error");
                return ConnectionStatus::offline(
                    true,
                    true,
                    &err,
                    "AnkiConnect is installed but not answering requests.",
                );
            }
            Err(err @ BridgeError::UnexpectedResponse { .. }) => {
                warn!(error = %err, "the AnkiConnect port gave a foreign answer");
                return ConnectionStatus::offline(
                    true,
                    false,
                    &err,
                    "Something answers on the AnkiConnect address, but it is not AnkiConnect.",
                );
            }
            Err(err) => {
                warn!(error = %err, "AnkiConnect is not reachable");
                return ConnectionStatus::offline(
                    false,
                    false,
                    &err,
                    "Anki is not running or the AnkiConnect add-on is not installed.",
                );
            }
        };

        if version < PROTOCOL_VERSION {
            warn!(version, required = PROTOCOL_VERSION, "AnkiConnect is too old");
            return ConnectionStatus {
                peer_running: true,
                add_on_available: true,
                version: Some(version),
                valid_version: false,
                templates_available: false,
                decks_available: false,
                error_details: None,
                message: format!(
                    "AnkiConnect version {} is not supported, version {} or newer is required.",
                    version, PROTOCOL_VERSION
                ),
            };
        }

        let (templates, decks) = futures::join!(self.template_names(), self.deck_names());
        let error_details = [templates.as_ref().err(), decks.as_ref().err()]
            .into_iter()
            .flatten()
            .map(ToString::to_string)
            .reduce(|a, b| format!("{}; {}", a, b));

        let message = match (&templates, &decks) {
            (Ok(_), Ok(_)) => format!("Connected to AnkiConnect version {}.", version),
            (Err(_), Ok(_)) => "Connected, but note types could not be listed.".to_string(),
            (Ok(_), Err(_)) => "Connected, but decks could not be listed.".to_string(),
            (Err(_), Err(_)) => "Connected, but neither note types nor decks could be listed.".to_string(),
        };

        let status = ConnectionStatus {
            peer_running: true,
            add_on_available: true,
            version: Some(version),
            valid_version: true,
            templates_available: templates.is_ok(),
            decks_available: decks.is_ok(),
            error_details,
            message,
        };
        info!(ready = status.is_ready(), version, "connection status checked");
        status
    }

    /// One `version` call with the probe timeout. Sent directly rather than
    /// through the retry executor so an error answer is told apart from no answer.
    async fn read_version(&self) -> Result<u32, BridgeError> {
        let body = self
            .transport
            .post(&RpcCall::bare("version"), self.probe_timeout)
            .await
            .map_err(|failure| BridgeError::unreachable("version", 1, failure.to_string()))?;
        let value = ApiResponse::decode(body)
            .map_err(|failure| BridgeError::UnexpectedResponse {
                action: "version".to_string(),
                detail: failure.to_string(),
            })?
            .into_result("version")?;
        serde_json::from_value(value).map_err(|e| BridgeError::UnexpectedResponse {
            action: "version".to_string(),
            detail: e.to_string(),
        })
    }
}
