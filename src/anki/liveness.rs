use std::time::Duration;

use tracing::{
    debug,
    info,
};

use super::api::{
    AnkiClient,
    ApiResponse,
    RpcCall,
};
use crate::core::{
    clock::Clock,
    http::Transport,
};

impl<T: Transport, C: Clock> AnkiClient<T, C> {
    /// Cheap reachability check: a single `version` call, no retries.
    ///
    /// True only for a well-formed answer with a non-null result. Refused,
    /// timed-out and garbled responses all read as "not there".
    pub async fn probe(&self, timeout: Duration) -> bool {
        let call = RpcCall::bare("version");
        match self.transport.post(&call, timeout).await {
            Ok(body) => match ApiResponse::decode(body) {
                Ok(response) => response.error.is_none() && response.result.is_some(),
                Err(failure) => {
                    debug!(error = %failure, "liveness probe got a malformed answer");
                    false
                }
            },
            Err(failure) => {
                debug!(error = %failure, "liveness probe failed");
                false
            }
        }
    }

    /// Polls until Anki answers, e.g. right after launching it.
    pub async fn wait_awake(&self, interval: Duration, max_attempts: u32) -> bool {
        for attempt in 1..=max_attempts {
            if self.probe(self.probe_timeout).await {
                info!(attempt, "AnkiConnect is online");
                return true;
            }
            debug!(attempt, max_attempts, "AnkiConnect not answering yet");
            if attempt < max_attempts {
                self.clock.sleep(interval).await;
            }
        }
        false
    }
}
