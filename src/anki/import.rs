use std::{
    collections::HashMap,
    fmt,
};

use tracing::{
    debug,
    info,
    warn,
};

use super::{
    api::AnkiClient,
    classify::{
        per_note_errors,
        PeerErrorKind,
    },
    mapping::map_fields_with_overrides,
    types::{
        ContentRecord,
        NativeNote,
        NoteOptions,
        NoteTemplate,
        TemplateDefinition,
    },
};
use crate::core::{
    clock::Clock,
    config::BridgeConfig,
    http::Transport,
    BridgeError,
};

/// Where a batch goes and how its notes are labelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub deck_name: String,
    pub template_name: String,
    pub tags: Vec<String>,
    pub allow_duplicates: bool,
    /// Fixed text for named note type fields, used for every record.
    pub field_overrides: HashMap<String, String>,
}

impl ImportRequest {
    pub fn new(deck_name: impl Into<String>, template_name: impl Into<String>) -> Self {
        Self {
            deck_name: deck_name.into(),
            template_name: template_name.into(),
            tags: Vec::new(),
            allow_duplicates: false,
            field_overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            deck_name: config.deck_name.clone(),
            template_name: config.template_name.clone(),
            tags: config.tags.clone(),
            allow_duplicates: config.allow_duplicates,
            field_overrides: config.field_overrides.clone(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    pub fn with_field_override(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_overrides.insert(field.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    /// The record could not be fitted into the note type.
    Mapping,
    /// `canAddNotes` said no.
    Validation,
    /// Submitted, but Anki did not store it.
    Persistence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// Position of the record in the input batch.
    pub index: usize,
    pub stage: ItemStage,
    pub message: String,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Card {}: {}", self.index + 1, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Note type the notes were actually written with.
    pub template_name: String,
    pub record_count: usize,
    pub submitted_count: usize,
    pub persisted_count: usize,
    /// Ids Anki reported. A batch answered with an error list stores notes
    /// without naming their ids, so this can be shorter than `persisted_count`.
    pub note_ids: Vec<u64>,
    pub item_errors: Vec<ItemError>,
}

impl ImportOutcome {
    pub fn per_item_errors(&self) -> Vec<String> {
        self.item_errors.iter().map(ToString::to_string).collect()
    }

    pub fn rejected_before_submission(&self) -> usize {
        self.count_stage(|stage| stage != ItemStage::Persistence)
    }

    pub fn rejected_by_peer(&self) -> usize {
        self.count_stage(|stage| stage == ItemStage::Persistence)
    }

    fn count_stage(&self, keep: impl Fn(ItemStage) -> bool) -> usize {
        self.item_errors.iter().filter(|error| keep(error.stage)).count()
    }

    pub fn is_complete(&self) -> bool {
        self.persisted_count == self.record_count
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Imported {} of {} card(s) using note type '{}'.",
            self.persisted_count, self.record_count, self.template_name
        )];

        let before = self.rejected_before_submission();
        if before > 0 {
            lines.push(format!("{} card(s) were invalid and never sent to Anki.", before));
        }
        let by_peer = self.rejected_by_peer();
        if by_peer > 0 {
            lines.push(format!(
                "Anki accepted the batch but did not store {} of {} submitted card(s).",
                by_peer, self.submitted_count
            ));
        }
        lines.extend(self.item_errors.iter().map(|error| format!("  - {}", error)));

        lines.join("\n")
    }
}

/// Request tags, then record tags, then the difficulty tag. Anki splits tags
/// on whitespace, so whitespace inside a tag becomes `_`.
pub fn note_tags(request_tags: &[String], record: &ContentRecord) -> Vec<String> {
    let difficulty = record.difficulty.map(|level| format!("difficulty:{}", level));

    let candidates = request_tags
        .iter()
        .map(String::as_str)
        .chain(record.tags.iter().map(String::as_str))
        .chain(difficulty.as_deref());

    let mut tags: Vec<String> = Vec::new();
    for tag in candidates {
        let tag = tag.split_whitespace().collect::<Vec<_>>().join("_");
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// What became of one submitted note.
enum Slot {
    /// Stored, with the id when Anki reported one.
    Stored(Option<u64>),
    Lost(Option<String>),
}

/// Reads an `addNotes` error. Recent AnkiConnect stores every note it can and
/// reports the rest as a list with one entry per note; anything else means
/// nothing was stored.
fn reconcile_error(message: &str, submitted: usize) -> Vec<Slot> {
    match per_note_errors(message) {
        Some(entries) if entries.len() == submitted => {
            warn!(error = %message, "Anki stored part of the batch");
            entries
                .into_iter()
                .map(|entry| match entry {
                    None => Slot::Stored(None),
                    Some(reason) => Slot::Lost(Some(reason)),
                })
                .collect()
        }
        _ => {
            warn!(error = %message, "Anki rejected the whole batch");
            (0..submitted).map(|_| Slot::Lost(Some(message.to_string()))).collect()
        }
    }
}

impl<T: Transport, C: Clock> AnkiClient<T, C> {
    /// Imports `records` into one deck with one note type.
    ///
    /// Provisioning problems and an unreachable Anki fail the whole call. Once
    /// notes are being built, problems stay per item: they end up in
    /// [`ImportOutcome::item_errors`] and the rest of the batch carries on.
    pub async fn import_batch(
        &self,
        records: &[ContentRecord],
        request: &ImportRequest,
    ) -> Result<ImportOutcome, BridgeError> {
        info!(
            records = records.len(),
            deck = %request.deck_name,
            template = %request.template_name,
            "starting import"
        );

        self.ensure_collection(&request.deck_name).await?;
        let template = self.resolve_template(&request.template_name).await?;
        for field in request.field_overrides.keys() {
            if !template.field_names.contains(field) {
                warn!(template = %template.name, field = %field, "override names a field the note type lacks");
            }
        }

        let mut item_errors = Vec::new();
        let mut pending: Vec<(usize, NativeNote)> = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            match map_fields_with_overrides(&template, record, &request.field_overrides) {
                Ok(fields) => pending.push((index, NativeNote {
                    deck_name: request.deck_name.clone(),
                    model_name: template.name.clone(),
                    fields,
                    tags: note_tags(&request.tags, record),
                    options: NoteOptions { allow_duplicate: request.allow_duplicates, ..Default::default() },
                })),
                Err(err) => {
                    debug!(index, error = %err, "record could not be mapped");
                    item_errors.push(ItemError { index, stage: ItemStage::Mapping, message: err.to_string() });
                }
            }
        }

        let pending = self.precheck(pending, records, &mut item_errors).await?;
        let submitted_count = pending.len();
        let mut note_ids = Vec::with_capacity(submitted_count);
        let mut persisted_count = 0;

        if !pending.is_empty() {
            let notes: Vec<NativeNote> = pending.iter().map(|(_, note)| note.clone()).collect();
            let slots: Vec<Slot> = match self.add_notes(&notes).await {
                Ok(ids) if ids.len() == notes.len() => ids
                    .into_iter()
                    .map(|id| match id {
                        Some(id) => Slot::Stored(Some(id)),
                        None => Slot::Lost(None),
                    })
                    .collect(),
                Ok(ids) => {
                    return Err(BridgeError::UnexpectedResponse {
                        action: "addNotes".to_string(),
                        detail: format!("{} result(s) for {} note(s)", ids.len(), notes.len()),
                    })
                }
                Err(BridgeError::Protocol { message, .. }) => reconcile_error(&message, notes.len()),
                Err(err) => return Err(err),
            };

            for ((index, _), slot) in pending.iter().zip(slots) {
                let reason = match slot {
                    Slot::Stored(id) => {
                        persisted_count += 1;
                        note_ids.extend(id);
                        continue;
                    }
                    Slot::Lost(reason) => reason,
                };
                let preview = records[*index].preview();
                item_errors.push(ItemError {
                    index: *index,
                    stage: ItemStage::Persistence,
                    message: match reason {
                        Some(reason) => format!("Anki did not store '{}': {}", preview, reason),
                        None => format!("Anki did not store '{}'", preview),
                    },
                });
            }
        }

        item_errors.sort_by_key(|error| error.index);
        let outcome = ImportOutcome {
            template_name: template.name,
            record_count: records.len(),
            submitted_count,
            persisted_count,
            note_ids,
            item_errors,
        };

        info!(
            submitted = outcome.submitted_count,
            persisted = outcome.persisted_count,
            rejected = outcome.item_errors.len(),
            "import finished"
        );
        Ok(outcome)
    }

    /// Makes sure the note type can be used and reads its fields. Note types
    /// this crate defines are created on demand, falling back to the simpler
    /// one when Anki refuses the richer definition.
    async fn resolve_template(&self, name: &str) -> Result<NoteTemplate, BridgeError> {
        let name = match TemplateDefinition::builtin(name) {
            Some(definition) => match self.ensure_template(&definition).await {
                Ok(_) => definition.name,
                Err(err) if err.peer_error_kind().is_some() => match definition.fallback() {
                    Some(fallback) => {
                        warn!(template = name, fallback = %fallback.name, error = %err, "falling back to simpler note type");
                        self.ensure_template(&fallback).await?;
                        fallback.name
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            },
            None => {
                if !self.template_names().await?.iter().any(|model| model == name) {
                    return Err(BridgeError::TemplateUnavailable(name.to_string()));
                }
                name.to_string()
            }
        };

        let field_names = self.template_field_names(&name).await?;
        debug!(template = %name, fields = ?field_names, "resolved note type");
        Ok(NoteTemplate::new(name, field_names))
    }

    /// Drops notes `canAddNotes` flags. Anki versions without the action get
    /// everything through.
    async fn precheck(
        &self,
        pending: Vec<(usize, NativeNote)>,
        records: &[ContentRecord],
        item_errors: &mut Vec<ItemError>,
    ) -> Result<Vec<(usize, NativeNote)>, BridgeError> {
        if pending.is_empty() {
            return Ok(pending);
        }

        let notes: Vec<NativeNote> = pending.iter().map(|(_, note)| note.clone()).collect();
        let verdicts = match self.can_add_notes(&notes).await {
            Ok(verdicts) if verdicts.len() == notes.len() => verdicts,
            Ok(verdicts) => {
                return Err(BridgeError::UnexpectedResponse {
                    action: "canAddNotes".to_string(),
                    detail: format!("{} verdict(s) for {} note(s)", verdicts.len(), notes.len()),
                })
            }
            Err(err) if err.peer_error_kind() == Some(PeerErrorKind::UnsupportedAction) => {
                debug!("canAddNotes not supported, skipping pre-check");
                return Ok(pending);
            }
            Err(err) => return Err(err),
        };

        let mut accepted = Vec::with_capacity(pending.len());
        for ((index, note), ok) in pending.into_iter().zip(verdicts) {
            if ok {
                accepted.push((index, note));
            } else {
                item_errors.push(ItemError {
                    index,
                    stage: ItemStage::Validation,
                    message: format!(
                        "Anki would not accept '{}' (duplicate or empty first field)",
                        records[index].preview()
                    ),
                });
            }
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        anki::{
            testing::{
                test_client,
                FakeAnki,
            },
            types::{
                Difficulty,
                DEFAULT_TEMPLATE,
                FALLBACK_TEMPLATE,
            },
        },
        core::http::FailureKind,
    };

    fn records(fronts: &[&str]) -> Vec<ContentRecord> {
        fronts.iter().map(|front| ContentRecord::new(*front, format!("answer to {}", front))).collect()
    }

    fn basic_anki() -> FakeAnki {
        FakeAnki::new().with_deck("Default").with_model("Basic", &["Front", "Back"])
    }

    fn assert_accounting(outcome: &ImportOutcome, record_count: usize) {
        assert!(outcome.persisted_count <= outcome.submitted_count);
        assert!(outcome.submitted_count <= record_count);
        assert!(outcome.item_errors.len() >= record_count - outcome.persisted_count);
    }

    #[tokio::test]
    async fn test_happy_path() {
        let client = test_client(basic_anki());
        let batch = records(&["first", "second"]);

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.submitted_count, 2);
        assert_eq!(outcome.persisted_count, 2);
        assert!(outcome.per_item_errors().is_empty());
        assert!(outcome.is_complete());
        assert_eq!(outcome.note_ids.len(), 2);
        assert_eq!(client.transport().notes()[1].fields["Front"], "second");
        assert_eq!(client.transport().call_count("addNotes"), 1);
    }

    #[tokio::test]
    async fn test_missing_deck_and_template_are_created() {
        let client = test_client(FakeAnki::new());
        let batch = records(&["first", "second"]);

        let outcome = client
            .import_batch(&batch, &ImportRequest::new("Rust", DEFAULT_TEMPLATE))
            .await
            .unwrap();

        assert_eq!(outcome.persisted_count, batch.len());
        assert_eq!(outcome.template_name, DEFAULT_TEMPLATE);
        assert_eq!(client.transport().decks(), vec!["Rust"]);
        assert_eq!(client.transport().model_names(), vec![DEFAULT_TEMPLATE]);
    }

    #[tokio::test]
    async fn test_record_failing_mapping_is_excluded() {
        let client = test_client(basic_anki());
        let mut batch = records(&["first", "third"]);
        batch.insert(1, ContentRecord::default());

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.submitted_count, batch.len() - 1);
        assert_eq!(outcome.persisted_count, 2);
        assert_eq!(outcome.item_errors.len(), 1);
        assert_eq!(outcome.item_errors[0].index, 1);
        assert_eq!(outcome.item_errors[0].stage, ItemStage::Mapping);
        assert_eq!(outcome.rejected_before_submission(), 1);
        assert_accounting(&outcome, batch.len());
    }

    #[tokio::test]
    async fn test_peer_rejects_one_of_two() {
        let fake = basic_anki();
        fake.reject_note_containing("second");
        let client = test_client(fake);
        let batch = records(&["first", "second"]);

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.submitted_count, 2);
        assert_eq!(outcome.persisted_count, 1);
        assert_eq!(outcome.rejected_by_peer(), 1);
        assert_eq!(outcome.per_item_errors(), vec!["Card 2: Anki did not store 'second'"]);
        assert!(!outcome.is_complete());
        assert_accounting(&outcome, batch.len());
    }

    #[tokio::test]
    async fn test_duplicates_are_caught_by_precheck() {
        let client = test_client(basic_anki());
        let batch = records(&["first"]);
        let request = ImportRequest::new("Default", "Basic");
        client.import_batch(&batch, &request).await.unwrap();

        let outcome = client.import_batch(&batch, &request).await.unwrap();

        assert_eq!(outcome.submitted_count, 0);
        assert_eq!(outcome.persisted_count, 0);
        assert_eq!(outcome.item_errors[0].stage, ItemStage::Validation);
        assert_eq!(client.transport().call_count("addNotes"), 1);
        assert_accounting(&outcome, batch.len());

        let outcome = client.import_batch(&batch, &request.clone().allow_duplicates(true)).await.unwrap();
        assert_eq!(outcome.persisted_count, 1);
        assert_eq!(client.transport().notes().len(), 2);
    }

    #[tokio::test]
    async fn test_precheck_skipped_when_unsupported() {
        let fake = basic_anki();
        fake.unsupported("canAddNotes");
        let client = test_client(fake);

        let outcome = client
            .import_batch(&records(&["first", "second"]), &ImportRequest::new("Default", "Basic"))
            .await
            .unwrap();

        assert_eq!(outcome.persisted_count, 2);
    }

    #[tokio::test]
    async fn test_whole_batch_error_marks_every_note_unpersisted() {
        let fake = basic_anki();
        fake.error_next("addNotes", "collection is not available");
        let client = test_client(fake);
        let batch = records(&["first", "second"]);

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.submitted_count, 2);
        assert_eq!(outcome.persisted_count, 0);
        assert_eq!(outcome.rejected_by_peer(), 2);
        assert_accounting(&outcome, batch.len());
    }

    #[tokio::test]
    async fn test_error_list_counts_stored_notes() {
        let fake = basic_anki();
        fake.error_next("addNotes", "['cannot create note because it is a duplicate', None]");
        let client = test_client(fake);
        let batch = records(&["first", "second"]);

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.submitted_count, 2);
        assert_eq!(outcome.persisted_count, 1);
        assert!(outcome.note_ids.is_empty());
        assert_eq!(outcome.item_errors.len(), 1);
        let error = &outcome.item_errors[0];
        assert_eq!((error.index, error.stage), (0, ItemStage::Persistence));
        assert!(error.message.ends_with("cannot create note because it is a duplicate"), "{}", error.message);
        assert!(!outcome.is_complete());
        assert_accounting(&outcome, batch.len());
    }

    #[tokio::test]
    async fn test_partial_store_reported_as_error_list() {
        let fake = basic_anki();
        fake.report_add_errors_as_list();
        fake.reject_note_containing("second");
        let client = test_client(fake);
        let batch = records(&["first", "second", "third"]);

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.persisted_count, 2);
        assert_eq!(client.transport().notes().len(), 2);
        assert_eq!(outcome.rejected_by_peer(), 1);
        assert_eq!(outcome.item_errors[0].index, 1);
        assert_accounting(&outcome, batch.len());
    }

    #[tokio::test]
    async fn test_error_list_of_wrong_length_stores_nothing() {
        let fake = basic_anki();
        fake.error_next("addNotes", "[None]");
        let client = test_client(fake);
        let batch = records(&["first", "second"]);

        let outcome = client.import_batch(&batch, &ImportRequest::new("Default", "Basic")).await.unwrap();

        assert_eq!(outcome.persisted_count, 0);
        assert_eq!(outcome.rejected_by_peer(), 2);
        assert_accounting(&outcome, batch.len());
    }

    #[tokio::test]
    async fn test_field_overrides_reach_every_note() {
        let fake = FakeAnki::new()
            .with_deck("Default")
            .with_model("Basic (optional reversed card)", &["Front", "Back", "Add Reverse"]);
        let client = test_client(fake);
        let request = ImportRequest::new("Default", "Basic (optional reversed card)")
            .with_field_override("Add Reverse", "y");

        let outcome = client.import_batch(&records(&["first", "second"]), &request).await.unwrap();

        assert!(outcome.is_complete());
        let notes = client.transport().notes();
        assert!(notes.iter().all(|note| note.fields["Add Reverse"] == "y"));
        assert_eq!(notes[1].fields["Front"], "second");
    }

    #[tokio::test]
    async fn test_falls_back_to_basic_template() {
        let fake = FakeAnki::new().with_deck("Default");
        fake.error_next("createModel", "failed to create model: invalid template");
        let client = test_client(fake);

        let outcome = client
            .import_batch(&records(&["first"]), &ImportRequest::new("Default", DEFAULT_TEMPLATE))
            .await
            .unwrap();

        assert_eq!(outcome.template_name, FALLBACK_TEMPLATE);
        assert_eq!(outcome.persisted_count, 1);
        let note = &client.transport().notes()[0];
        assert_eq!(note.model_name, FALLBACK_TEMPLATE);
        assert_eq!(note.fields["Frente"], "first");
    }

    #[tokio::test]
    async fn test_unknown_template_aborts() {
        let client = test_client(basic_anki());

        let err = client
            .import_batch(&records(&["first"]), &ImportRequest::new("Default", "Japanese (recognition)"))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::TemplateUnavailable(ref name) if name == "Japanese (recognition)"));
        assert_eq!(client.transport().call_count("addNotes"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_anki_fails_the_batch() {
        let fake = basic_anki();
        fake.go_down_after("deckNames");
        let client = test_client(fake);

        let err = client
            .import_batch(&records(&["first"]), &ImportRequest::new("Default", DEFAULT_TEMPLATE))
            .await
            .unwrap_err();

        assert!(err.is_peer_unreachable(), "got {:?}", err);
        assert_eq!(client.transport().call_count("createModel"), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_during_submit_is_retried() {
        let fake = basic_anki();
        fake.fail_next("addNotes", FailureKind::Timeout);
        let client = test_client(fake);

        let outcome = client
            .import_batch(&records(&["first"]), &ImportRequest::new("Default", "Basic"))
            .await
            .unwrap();

        assert_eq!(outcome.persisted_count, 1);
        assert_eq!(client.transport().call_count("addNotes"), 2);
    }

    #[tokio::test]
    async fn test_notes_carry_request_settings() {
        let client = test_client(basic_anki());
        let mut record = ContentRecord::new("first", "answer");
        record.tags = BTreeSet::from(["rust".to_string()]);
        record.difficulty = Some(Difficulty::Advanced);
        let request = ImportRequest::new("Default", "Basic").with_tags(["ankibridge", "rust"]);

        client.import_batch(&[record], &request).await.unwrap();

        let note = &client.transport().notes()[0];
        assert_eq!(note.deck_name, "Default");
        assert_eq!(note.tags, vec!["ankibridge", "rust", "difficulty:advanced"]);
        assert!(!note.options.allow_duplicate);
        assert_eq!(note.options.duplicate_scope, "deck");
    }

    #[test]
    fn test_note_tags_are_deduplicated_and_joined() {
        let mut record = ContentRecord::new("q", "a");
        record.tags = BTreeSet::from(["machine learning".to_string(), "ai".to_string()]);

        let tags = note_tags(&["ai".to_string(), "  ".to_string(), "my deck".to_string()], &record);

        assert_eq!(tags, vec!["ai", "my_deck", "machine_learning"]);
    }

    #[test]
    fn test_summary_separates_stages() {
        let outcome = ImportOutcome {
            template_name: "Basic".to_string(),
            record_count: 3,
            submitted_count: 2,
            persisted_count: 1,
            note_ids: vec![1],
            item_errors: vec![
                ItemError { index: 0, stage: ItemStage::Mapping, message: "empty".to_string() },
                ItemError { index: 2, stage: ItemStage::Persistence, message: "not stored".to_string() },
            ],
        };

        let summary = outcome.summary();

        assert!(summary.starts_with("Imported 1 of 3 card(s) using note type 'Basic'."));
        assert!(summary.contains("1 card(s) were invalid and never sent to Anki."));
        assert!(summary.contains("did not store 1 of 2 submitted card(s)"));
        assert!(summary.contains("  - Card 3: not stored"));
    }
}
