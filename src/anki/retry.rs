use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{
    debug,
    info,
    warn,
};

use super::{
    api::{
        AnkiClient,
        ApiResponse,
        RpcCall,
    },
    classify::classify_transport,
};
use crate::core::{
    clock::Clock,
    http::{
        FailureKind,
        Transport,
        TransportFailure,
    },
    BridgeError,
};

pub const MAX_BACKOFF: Duration = Duration::from_secs(10);
pub const MAX_JITTER: Duration = Duration::from_secs(1);
pub const RESET_RECOVERY_PAUSE: Duration = Duration::from_secs(3);
const BULK_TIMEOUT: Duration = Duration::from_secs(30);

/// How hard one call site is willing to try. `max_attempts` is at least 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub per_attempt_timeout: Duration,
    /// Added to the timeout once per attempt after the first.
    pub timeout_escalation: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
    /// Extra wait after a connection reset so Anki can bring its listener back.
    pub reset_recovery_pause: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Result<Self, BridgeError> {
        Self::standard().with_max_attempts(max_attempts)
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            per_attempt_timeout: Duration::from_secs(15),
            timeout_escalation: Duration::ZERO,
            max_backoff: MAX_BACKOFF,
            max_jitter: MAX_JITTER,
            reset_recovery_pause: RESET_RECOVERY_PAUSE,
        }
    }

    /// For calls carrying a whole batch of notes.
    pub fn bulk() -> Self {
        Self { per_attempt_timeout: BULK_TIMEOUT, ..Self::standard() }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self, BridgeError> {
        if max_attempts == 0 {
            return Err(BridgeError::InvalidPolicy(
                "max_attempts must be at least 1 (use 1 for no retries)".to_string(),
            ));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Timeout for the 1-based `attempt`. A peer that is slow to recover gets
    /// more time on later attempts, not only more attempts.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        self.per_attempt_timeout * attempt.min(3) + self.timeout_escalation * (attempt - 1)
    }

    /// Delay before retry number `retry` (0 for the first retry), without jitter.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry.min(64) as i32);
        let seconds = (self.base_delay.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    pub(crate) fn for_bulk(&self) -> Self {
        Self { per_attempt_timeout: self.per_attempt_timeout.max(BULK_TIMEOUT), ..self.clone() }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl<T: Transport, C: Clock> AnkiClient<T, C> {
    /// Sends `call` until a well-formed envelope comes back or `policy` runs out.
    ///
    /// An envelope carrying an `error` still ends the loop; only transport
    /// failures are retried. The peer is probed before the first attempt and
    /// after every connection reset, and a failed probe ends the call at once.
    pub async fn execute(
        &self,
        call: &RpcCall,
        policy: &RetryPolicy,
    ) -> Result<ApiResponse<Value>, BridgeError> {
        let action = call.action.as_str();

        if !self.probe(self.probe_timeout).await {
            warn!(action, "Anki did not answer the liveness probe");
            return Err(BridgeError::unreachable(action, 0, "liveness probe failed"));
        }

        let max_attempts = policy.max_attempts();
        let mut last_failure: Option<TransportFailure> = None;

        for attempt in 1..=max_attempts {
            let timeout = policy.timeout_for(attempt);
            debug!(action, attempt, timeout_ms = timeout.as_millis() as u64, "sending request");

            let outcome = match self.transport.post(call, timeout).await {
                Ok(body) => ApiResponse::decode(body),
                Err(failure) => Err(failure),
            };

            let failure = match outcome {
                Ok(response) => {
                    if attempt > 1 {
                        info!(action, attempt, "request succeeded after retrying");
                    }
                    return Ok(response);
                }
                Err(failure) => failure,
            };

            if !classify_transport(&failure).is_retryable() {
                warn!(action, attempt, error = %failure, "request failed, not retrying");
                return Err(BridgeError::Transport { action: action.to_string(), failure });
            }

            warn!(action, attempt, max_attempts, error = %failure, "request failed");
            let was_reset = failure.kind == FailureKind::Reset;
            let cause = failure.to_string();
            last_failure = Some(failure);

            if attempt == max_attempts {
                break;
            }

            if was_reset {
                self.clock.sleep(policy.reset_recovery_pause).await;
                if !self.probe(self.probe_timeout).await {
                    return Err(BridgeError::unreachable(
                        action,
                        attempt,
                        format!("{}; no answer to the liveness probe afterwards", cause),
                    ));
                }
            }

            let delay = policy.backoff_for(attempt - 1) + policy.jitter();
            debug!(action, delay_ms = delay.as_millis() as u64, "backing off");
            self.clock.sleep(delay).await;
        }

        let cause = last_failure
            .map(|failure| failure.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());
        Err(BridgeError::unreachable(action, max_attempts, cause))
    }
}
