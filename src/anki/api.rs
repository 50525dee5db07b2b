use std::time::Duration;

use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use serde_json::{
    json,
    Value,
};
use tracing::{
    debug,
    warn,
};

use super::{
    classify::peer_error_kind,
    retry::RetryPolicy,
    types::{
        NativeNote,
        NoteTemplate,
        TemplateDefinition,
    },
};
use crate::core::{
    clock::{
        Clock,
        TokioClock,
    },
    config::BridgeConfig,
    http::{
        FailureKind,
        HttpTransport,
        Transport,
        TransportFailure,
    },
    BridgeError,
};

pub const ANKI_CONNECT_URL: &str = "http://127.0.0.1:8765";
pub const PROTOCOL_VERSION: u32 = 6;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub action: String,
    pub version: u32,
    pub params: Value,
}

impl RpcCall {
    pub fn new(action: &str, params: Value) -> Self {
        Self { action: action.to_string(), version: PROTOCOL_VERSION, params }
    }

    pub fn bare(action: &str) -> Self {
        Self::new(action, json!({}))
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub result: Option<T>,
    pub error: Option<String>,
}

impl ApiResponse<Value> {
    /// Anything that is not a `{result, error}` object counts as a transport
    /// failure: the peer did not really answer.
    pub fn decode(body: Value) -> Result<Self, TransportFailure> {
        let mut map = match body {
            Value::Object(map) => map,
            other => {
                return Err(TransportFailure::new(
                    FailureKind::Malformed,
                    format!("expected a JSON object, got {}", other),
                ))
            }
        };

        if !map.contains_key("result") && !map.contains_key("error") {
            return Err(TransportFailure::new(
                FailureKind::Malformed,
                "response has neither 'result' nor 'error'",
            ));
        }

        let error = match map.remove("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message),
            Some(other) => Some(other.to_string()),
        };
        let result = match map.remove("result") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value),
        };

        Ok(Self { result, error })
    }

    pub fn into_result(self, action: &str) -> Result<Value, BridgeError> {
        match self.error {
            Some(message) => Err(BridgeError::Protocol {
                action: action.to_string(),
                kind: peer_error_kind(&message),
                message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Client for one AnkiConnect instance.
///
/// Holds no per-call state; every method builds its own request, so one client
/// can serve several independent imports.
pub struct AnkiClient<T = HttpTransport, C = TokioClock> {
    pub(crate) transport: T,
    pub(crate) clock: C,
    pub(crate) probe_timeout: Duration,
    pub(crate) policy: RetryPolicy,
    pub(crate) bulk_policy: RetryPolicy,
}

impl AnkiClient {
    pub fn connect(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let transport = HttpTransport::new(config.endpoint.clone())?;
        let policy = config.retry.to_policy()?;
        Ok(AnkiClient::with_transport(transport, TokioClock)
            .with_policy(policy)
            .with_probe_timeout(config.probe_timeout()))
    }
}

impl<T: Transport, C: Clock> AnkiClient<T, C> {
    pub fn with_transport(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            probe_timeout: PROBE_TIMEOUT,
            policy: RetryPolicy::standard(),
            bulk_policy: RetryPolicy::bulk(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.bulk_policy = policy.for_bulk();
        self.policy = policy;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `action` and decodes its result. A non-null `error` becomes
    /// [`BridgeError::Protocol`].
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        action: &str,
        params: Value,
        policy: &RetryPolicy,
    ) -> Result<R, BridgeError> {
        let call = RpcCall::new(action, params);
        let value = self.execute(&call, policy).await?.into_result(action)?;
        serde_json::from_value(value).map_err(|e| BridgeError::UnexpectedResponse {
            action: action.to_string(),
            detail: e.to_string(),
        })
    }

    pub async fn version(&self) -> Result<u32, BridgeError> {
        self.invoke("version", json!({}), &self.policy).await
    }

    pub async fn deck_names(&self) -> Result<Vec<String>, BridgeError> {
        self.invoke("deckNames", json!({}), &self.policy).await
    }

    pub async fn create_deck(&self, name: &str) -> Result<u64, BridgeError> {
        self.invoke("createDeck", json!({ "deck": name }), &self.policy).await
    }

    pub async fn template_names(&self) -> Result<Vec<String>, BridgeError> {
        self.invoke("modelNames", json!({}), &self.policy).await
    }

    pub async fn template_field_names(&self, name: &str) -> Result<Vec<String>, BridgeError> {
        self.invoke("modelFieldNames", json!({ "modelName": name }), &self.policy).await
    }

    /// Every note type with its fields. Field lookups run concurrently; a note
    /// type whose fields cannot be read is left out.
    pub async fn templates(&self) -> Result<Vec<NoteTemplate>, BridgeError> {
        let names = self.template_names().await?;

        let lookups = names.into_iter().map(|name| async move {
            match self.template_field_names(&name).await {
                Ok(field_names) => Some(NoteTemplate::new(name, field_names)),
                Err(err) => {
                    warn!(template = %name, error = %err, "skipping note type");
                    None
                }
            }
        });

        Ok(futures::future::join_all(lookups).await.into_iter().flatten().collect())
    }

    pub async fn create_template(&self, definition: &TemplateDefinition) -> Result<Value, BridgeError> {
        let params = json!({
            "modelName": definition.name,
            "inOrderFields": definition.fields,
            "css": definition.css,
            "cardTemplates": definition.card_templates,
        });
        self.invoke("createModel", params, &self.policy).await
    }

    pub async fn can_add_notes(&self, notes: &[NativeNote]) -> Result<Vec<bool>, BridgeError> {
        self.invoke("canAddNotes", json!({ "notes": notes }), &self.bulk_policy).await
    }

    pub async fn add_note(&self, note: &NativeNote) -> Result<u64, BridgeError> {
        debug!(deck = %note.deck_name, model = %note.model_name, "adding single note");
        self.invoke("addNote", json!({ "note": note }), &self.policy).await
    }

    /// One slot per note, `None` where Anki did not store it.
    pub async fn add_notes(&self, notes: &[NativeNote]) -> Result<Vec<Option<u64>>, BridgeError> {
        self.invoke("addNotes", json!({ "notes": notes }), &self.bulk_policy).await
    }
}
