//! In-memory AnkiConnect used by the unit tests.

use std::{
    collections::{
        HashMap,
        HashSet,
        VecDeque,
    },
    future::Future,
    sync::Mutex,
    time::Duration,
};

use serde_json::{
    json,
    Value,
};

use super::{
    api::{
        AnkiClient,
        RpcCall,
    },
    retry::RetryPolicy,
    types::NativeNote,
};
use crate::core::{
    clock::Clock,
    http::{
        FailureKind,
        Transport,
        TransportFailure,
    },
};

#[derive(Default)]
struct FakeState {
    decks: Vec<String>,
    models: Vec<(String, Vec<String>)>,
    notes: Vec<NativeNote>,
    calls: Vec<(String, Duration)>,
    down: bool,
    down_after: HashSet<String>,
    failures: HashMap<String, VecDeque<FailureKind>>,
    always_fail: HashMap<String, FailureKind>,
    scripted: HashMap<String, VecDeque<Value>>,
    reject_on_add: Vec<String>,
    list_add_errors: bool,
    create_model_error: Option<String>,
    unsupported: HashSet<String>,
}

#[derive(Default)]
pub struct FakeAnki {
    state: Mutex<FakeState>,
}

impl FakeAnki {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deck(self, name: &str) -> Self {
        self.state.lock().unwrap().decks.push(name.to_string());
        self
    }

    pub fn with_model(self, name: &str, fields: &[&str]) -> Self {
        let fields = fields.iter().map(|f| f.to_string()).collect();
        self.state.lock().unwrap().models.push((name.to_string(), fields));
        self
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    /// The next `action` call still gets its answer, everything after is refused.
    pub fn go_down_after(&self, action: &str) {
        self.state.lock().unwrap().down_after.insert(action.to_string());
    }

    pub fn fail_next(&self, action: &str, kind: FailureKind) {
        self.state.lock().unwrap().failures.entry(action.to_string()).or_default().push_back(kind);
    }

    pub fn fail_always(&self, action: &str, kind: FailureKind) {
        self.state.lock().unwrap().always_fail.insert(action.to_string(), kind);
    }

    /// Queue a raw response body for the next `action` call.
    pub fn respond_with(&self, action: &str, body: Value) {
        self.state.lock().unwrap().scripted.entry(action.to_string()).or_default().push_back(body);
    }

    pub fn error_next(&self, action: &str, message: &str) {
        self.respond_with(action, json!({ "result": null, "error": message }));
    }

    /// `addNotes` answers `null` for notes with a field containing `text`.
    pub fn reject_note_containing(&self, text: &str) {
        self.state.lock().unwrap().reject_on_add.push(text.to_string());
    }

    /// `addNotes` stores what it can and reports the rest as an error list,
    /// as AnkiConnect 6 on recent Anki does, instead of `null` slots.
    pub fn report_add_errors_as_list(&self) {
        self.state.lock().unwrap().list_add_errors = true;
    }

    /// `createModel` creates the model and then reports `message` anyway.
    pub fn create_model_applies_then_fails(&self, message: &str) {
        self.state.lock().unwrap().create_model_error = Some(message.to_string());
    }

    pub fn unsupported(&self, action: &str) {
        self.state.lock().unwrap().unsupported.insert(action.to_string());
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|(a, _)| a == action).count()
    }

    pub fn timeouts(&self, action: &str) -> Vec<Duration> {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|(a, _)| a == action).map(|(_, timeout)| *timeout).collect()
    }

    pub fn decks(&self) -> Vec<String> {
        self.state.lock().unwrap().decks.clone()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.state.lock().unwrap().models.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn notes(&self) -> Vec<NativeNote> {
        self.state.lock().unwrap().notes.clone()
    }

    fn respond(&self, call: &RpcCall, timeout: Duration) -> Result<Value, TransportFailure> {
        let mut state = self.state.lock().unwrap();
        let action = call.action.as_str();
        state.calls.push((action.to_string(), timeout));

        if state.down {
            return Err(TransportFailure::new(FailureKind::Refused, "fake Anki is down"));
        }
        if state.down_after.remove(action) {
            state.down = true;
        }
        if let Some(kind) = state.failures.get_mut(action).and_then(VecDeque::pop_front) {
            return Err(TransportFailure::new(kind, "scripted failure"));
        }
        if let Some(kind) = state.always_fail.get(action) {
            return Err(TransportFailure::new(*kind, "scripted failure"));
        }
        if let Some(body) = state.scripted.get_mut(action).and_then(VecDeque::pop_front) {
            return Ok(body);
        }

        Ok(match state.dispatch(action, &call.params) {
            Ok(result) => json!({ "result": result, "error": null }),
            Err(message) => json!({ "result": null, "error": message }),
        })
    }
}

impl FakeState {
    fn dispatch(&mut self, action: &str, params: &Value) -> Result<Value, String> {
        if self.unsupported.contains(action) {
            return Err("unsupported action".to_string());
        }

        match action {
            "version" => Ok(json!(6)),
            "deckNames" => Ok(json!(self.decks)),
            "createDeck" => {
                let name = params["deck"].as_str().ok_or("missing deck")?.to_string();
                let position = match self.decks.iter().position(|deck| *deck == name) {
                    Some(position) => position,
                    None => {
                        self.decks.push(name);
                        self.decks.len() - 1
                    }
                };
                Ok(json!(1_000 + position as u64))
            }
            "modelNames" => Ok(json!(self.models.iter().map(|(name, _)| name).collect::<Vec<_>>())),
            "modelFieldNames" => {
                let name = params["modelName"].as_str().unwrap_or_default();
                self.fields_of(name)
                    .map(|fields| json!(fields))
                    .ok_or_else(|| format!("model was not found: {}", name))
            }
            "createModel" => {
                let name = params["modelName"].as_str().ok_or("missing modelName")?.to_string();
                if self.fields_of(&name).is_some() {
                    return Err("Model name already exists".to_string());
                }
                let fields: Vec<String> =
                    serde_json::from_value(params["inOrderFields"].clone()).map_err(|e| e.to_string())?;
                self.models.push((name.clone(), fields));
                match self.create_model_error.take() {
                    Some(message) => Err(message),
                    None => Ok(json!({ "name": name, "id": 1_700_000_000_000u64 })),
                }
            }
            "canAddNotes" => {
                let notes = parse_notes(&params["notes"])?;
                Ok(json!(notes.iter().map(|note| self.can_add(note)).collect::<Vec<_>>()))
            }
            "addNote" => {
                let note: NativeNote =
                    serde_json::from_value(params["note"].clone()).map_err(|e| e.to_string())?;
                self.store(note).ok_or_else(|| "cannot create note because it is a duplicate".to_string()).map(|id| json!(id))
            }
            "addNotes" => {
                let notes = parse_notes(&params["notes"])?;
                let ids: Vec<Option<u64>> = notes.into_iter().map(|note| self.store(note)).collect();
                if self.list_add_errors && ids.contains(&None) {
                    let entries: Vec<&str> = ids
                        .iter()
                        .map(|id| match id {
                            Some(_) => "None",
                            None => "'cannot create note because it is a duplicate'",
                        })
                        .collect();
                    return Err(format!("[{}]", entries.join(", ")));
                }
                Ok(json!(ids))
            }
            _ => Err("unsupported action".to_string()),
        }
    }

    fn fields_of(&self, model: &str) -> Option<&Vec<String>> {
        self.models.iter().find(|(name, _)| name == model).map(|(_, fields)| fields)
    }

    fn first_field<'a>(&self, note: &'a NativeNote) -> Option<&'a str> {
        let first = self.fields_of(&note.model_name)?.first()?;
        note.fields.get(first).map(String::as_str)
    }

    fn can_add(&self, note: &NativeNote) -> bool {
        if !self.decks.contains(&note.deck_name) {
            return false;
        }
        let Some(first) = self.first_field(note).filter(|value| !value.trim().is_empty()) else {
            return false;
        };
        note.options.allow_duplicate
            || !self.notes.iter().any(|stored| {
                stored.model_name == note.model_name
                    && stored.deck_name == note.deck_name
                    && self.first_field(stored) == Some(first)
            })
    }

    fn store(&mut self, note: NativeNote) -> Option<u64> {
        let rejected = self
            .reject_on_add
            .iter()
            .any(|text| note.fields.values().any(|value| value.contains(text.as_str())));
        if rejected || !self.can_add(&note) {
            return None;
        }
        self.notes.push(note);
        Some(1_600_000_000_000 + self.notes.len() as u64)
    }
}

fn parse_notes(value: &Value) -> Result<Vec<NativeNote>, String> {
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

impl Transport for FakeAnki {
    fn post(
        &self,
        call: &RpcCall,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, TransportFailure>> + Send {
        std::future::ready(self.respond(call, timeout))
    }
}

#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for RecordingClock {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.sleeps.lock().unwrap().push(duration);
        std::future::ready(())
    }
}

/// Fast, deterministic policy: 100ms base, doubling, no jitter.
pub fn test_policy(max_attempts: u32) -> RetryPolicy {
    let mut policy = RetryPolicy::standard().without_jitter();
    policy.base_delay = Duration::from_millis(100);
    policy.backoff_factor = 2.0;
    policy.per_attempt_timeout = Duration::from_secs(1);
    policy.with_max_attempts(max_attempts).unwrap()
}

pub fn test_client(fake: FakeAnki) -> AnkiClient<FakeAnki, RecordingClock> {
    AnkiClient::with_transport(fake, RecordingClock::default()).with_policy(test_policy(3))
}
