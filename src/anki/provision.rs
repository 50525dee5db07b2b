use tracing::{
    debug,
    info,
    warn,
};

use super::{
    api::AnkiClient,
    classify::{
        mentions_any_field,
        PeerErrorKind,
    },
    types::TemplateDefinition,
};
use crate::core::{
    clock::Clock,
    http::Transport,
    BridgeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    AlreadyPresent,
    Created,
    /// Anki reported an error but the resource exists afterwards.
    Recovered,
}

impl<T: Transport, C: Clock> AnkiClient<T, C> {
    /// Makes sure the deck exists. `createDeck` is a no-op for an existing
    /// deck, so there is nothing to re-check afterwards.
    pub async fn ensure_collection(&self, name: &str) -> Result<Provisioned, BridgeError> {
        let decks = self.deck_names().await?;
        if decks.iter().any(|deck| deck == name) {
            debug!(deck = name, "deck already exists");
            return Ok(Provisioned::AlreadyPresent);
        }

        info!(deck = name, "creating deck");
        self.create_deck(name).await?;
        Ok(Provisioned::Created)
    }

    /// Makes sure the note type exists, creating it from `definition` if needed.
    ///
    /// When `createModel` fails with a message naming one of the declared
    /// fields (or saying the name is taken), Anki may well have created the
    /// note type anyway. The listing decides: if the name is there now, the
    /// step succeeded.
    pub async fn ensure_template(
        &self,
        definition: &TemplateDefinition,
    ) -> Result<Provisioned, BridgeError> {
        let name = definition.name.as_str();
        if self.template_names().await?.iter().any(|model| model == name) {
            debug!(template = name, "note type already exists");
            return Ok(Provisioned::AlreadyPresent);
        }

        info!(template = name, fields = ?definition.fields, "creating note type");
        let error = match self.create_template(definition).await {
            Ok(_) => return Ok(Provisioned::Created),
            Err(error) => error,
        };

        let worth_rechecking = match &error {
            BridgeError::Protocol { kind: PeerErrorKind::ModelExists, .. } => true,
            BridgeError::Protocol { message, .. } => mentions_any_field(message, &definition.fields),
            _ => false,
        };
        if !worth_rechecking {
            warn!(template = name, error = %error, "creating note type failed");
            return Err(error);
        }

        warn!(template = name, error = %error, "createModel reported an error, checking whether it applied");
        if self.template_names().await?.iter().any(|model| model == name) {
            info!(template = name, "note type exists despite the error");
            return Ok(Provisioned::Recovered);
        }
        Err(error)
    }
}
