//! Fitting a [`ContentRecord`] into whatever fields a note type declares.
//!
//! Note types are defined by the user's Anki, so the field list is open-ended.
//! Each declared field gets a role, decided by the first rule that applies:
//!
//! 0. a caller-supplied override, which fixes the field's text for every
//!    record and takes the field out of the rules below,
//! 1. the exact table of well-known note types (built-ins, their Portuguese
//!    variants and the note types this crate creates),
//! 2. keyword families matched against the lower-cased field name,
//! 3. position: with no front-like field the first unclaimed field becomes
//!    the front, and likewise the next one becomes the back.
//!
//! Front and back fields left empty are filled from `extra` when it has text.
//! If one is still empty the record is refused with [`MappingError`].

use std::{
    collections::HashMap,
    sync::OnceLock,
};

use regex::Regex;
use thiserror::Error;

use super::types::{
    ContentRecord,
    NoteTemplate,
    DEFAULT_TEMPLATE,
    FALLBACK_TEMPLATE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Front,
    Back,
    Extra,
    /// Front text of a cloze note type; gets wrapped in a deletion.
    ClozeText,
    /// Known field that must stay empty, e.g. "Add Reverse".
    Blank,
}

impl Role {
    pub fn is_required(self) -> bool {
        matches!(self, Role::Front | Role::Back | Role::ClozeText)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("nothing to put in {} of note type '{template}'", .empty_fields.join(", "))]
pub struct MappingError {
    pub template: String,
    pub empty_fields: Vec<String>,
}

type FieldTable = &'static [(&'static str, Role)];

const BASIC: FieldTable = &[("Front", Role::Front), ("Back", Role::Back)];
const BASIC_OPTIONAL_REVERSE: FieldTable =
    &[("Front", Role::Front), ("Back", Role::Back), ("Add Reverse", Role::Blank)];
const CLOZE: FieldTable = &[("Text", Role::ClozeText), ("Back Extra", Role::Back)];
const BASICO: FieldTable = &[("Frente", Role::Front), ("Verso", Role::Back)];
const BASICO_OPTIONAL_REVERSE: FieldTable =
    &[("Frente", Role::Front), ("Verso", Role::Back), ("Adicionar Verso", Role::Blank)];
const OMISSAO: FieldTable = &[("Texto", Role::ClozeText), ("Verso Extra", Role::Back)];
const FLASHCARDS: FieldTable =
    &[("Front", Role::Front), ("Back", Role::Back), ("Extra", Role::Extra)];

pub const KNOWN_TEMPLATES: &[(&str, FieldTable)] = &[
    ("Basic", BASIC),
    ("Basic (and reversed card)", BASIC),
    ("Basic (optional reversed card)", BASIC_OPTIONAL_REVERSE),
    ("Basic (type in the answer)", BASIC),
    ("Cloze", CLOZE),
    ("Básico", BASICO),
    ("Básico (e cartão invertido)", BASICO),
    ("Básico (cartão invertido opcional)", BASICO_OPTIONAL_REVERSE),
    ("Básico (digite a resposta)", BASICO),
    ("Omissão de Palavras", OMISSAO),
    (DEFAULT_TEMPLATE, FLASHCARDS),
    (FALLBACK_TEMPLATE, BASICO),
];

const KEYWORD_FAMILIES: &[(Role, &[&str])] = &[
    (Role::Front, &["front", "frente", "question", "pergunta"]),
    (Role::Back, &["back", "verso", "answer", "resposta"]),
    (Role::Extra, &["extra", "note", "nota"]),
];

pub fn known_template(name: &str) -> Option<FieldTable> {
    KNOWN_TEMPLATES.iter().find(|(known, _)| *known == name).map(|(_, table)| *table)
}

fn is_cloze_template(template: &NoteTemplate) -> bool {
    let name = template.name.to_lowercase();
    name.contains("cloze")
        || name.contains("omissão")
        || template.field_names.iter().any(|field| is_cloze_field(&field.to_lowercase()))
}

fn is_cloze_field(lower: &str) -> bool {
    lower == "text" || lower == "texto" || lower.contains("cloze")
}

fn keyword_role(field: &str, cloze: bool) -> Option<Role> {
    let lower = field.to_lowercase();
    if cloze && is_cloze_field(&lower) {
        return Some(Role::ClozeText);
    }
    KEYWORD_FAMILIES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| lower.contains(keyword)))
        .map(|(role, _)| *role)
}

/// Role of every declared field, in declaration order. `None` means the field
/// is left empty.
pub fn assign_roles(template: &NoteTemplate) -> Vec<Option<Role>> {
    assign_roles_with_overrides(template, &HashMap::new())
}

/// Like [`assign_roles`], with overridden fields marked [`Role::Blank`] so no
/// rule, positional fallback included, hands them record text.
pub fn assign_roles_with_overrides(
    template: &NoteTemplate,
    overrides: &HashMap<String, String>,
) -> Vec<Option<Role>> {
    let table = known_template(&template.name);
    let cloze = is_cloze_template(template);

    let mut roles: Vec<Option<Role>> = template
        .field_names
        .iter()
        .map(|field| {
            if overrides.contains_key(field) {
                return Some(Role::Blank);
            }
            table
                .and_then(|entries| entries.iter().find(|(name, _)| *name == field.as_str()))
                .map(|(_, role)| *role)
                .or_else(|| keyword_role(field, cloze))
        })
        .collect();

    if !roles.iter().any(|role| matches!(role, Some(Role::Front | Role::ClozeText))) {
        if let Some(slot) = roles.iter_mut().find(|role| role.is_none()) {
            *slot = Some(if cloze { Role::ClozeText } else { Role::Front });
        }
    }
    if !roles.contains(&Some(Role::Back)) {
        if let Some(slot) = roles.iter_mut().find(|role| role.is_none()) {
            *slot = Some(Role::Back);
        }
    }

    roles
}

pub fn map_fields(
    template: &NoteTemplate,
    record: &ContentRecord,
) -> Result<HashMap<String, String>, MappingError> {
    map_fields_with_overrides(template, record, &HashMap::new())
}

/// Fields named in `overrides` get the given text verbatim. Override keys the
/// note type does not declare are ignored.
pub fn map_fields_with_overrides(
    template: &NoteTemplate,
    record: &ContentRecord,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>, MappingError> {
    let roles = assign_roles_with_overrides(template, overrides);
    let extra = record.extra_text();

    let mut fields = HashMap::with_capacity(template.field_names.len());
    let mut empty_fields = Vec::new();

    for (field, role) in template.field_names.iter().zip(roles) {
        if let Some(fixed) = overrides.get(field) {
            fields.insert(field.clone(), fixed.clone());
            continue;
        }

        let direct = match role {
            Some(Role::Front | Role::ClozeText) => non_blank(&record.front),
            Some(Role::Back) => non_blank(&record.back),
            Some(Role::Extra) => extra,
            Some(Role::Blank) | None => None,
        };

        // Salvage: better the extra text than an empty required field
        let text = match role {
            Some(role) if role.is_required() => direct.or(extra),
            _ => direct,
        };

        let value = match (role, text) {
            (Some(Role::ClozeText), Some(text)) => wrap_cloze(text),
            (_, Some(text)) => text.to_string(),
            (_, None) => String::new(),
        };

        if role.is_some_and(Role::is_required) && value.is_empty() {
            empty_fields.push(field.clone());
        }
        fields.insert(field.clone(), value);
    }

    if !empty_fields.is_empty() {
        return Err(MappingError { template: template.name.clone(), empty_fields });
    }

    Ok(fields)
}

fn non_blank(text: &str) -> Option<&str> {
    (!text.trim().is_empty()).then_some(text)
}

fn cloze_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\{\{c\d+::").expect("cloze marker pattern is valid"))
}

/// Leaves text that already has a deletion alone, otherwise deletes all of it.
pub fn wrap_cloze(text: &str) -> String {
    if cloze_marker().is_match(text) {
        text.to_string()
    } else {
        format!("{{{{c1::{}}}}}", text)
    }
}
