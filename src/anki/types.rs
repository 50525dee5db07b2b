use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    fmt,
};

use serde::{
    Deserialize,
    Serialize,
};

pub const DEFAULT_TEMPLATE: &str = "AnkiBridge Flashcards";
pub const FALLBACK_TEMPLATE: &str = "AnkiBridge Basic";

/// A note type as Anki currently declares it. Only valid for one import pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteTemplate {
    pub name: String,
    pub field_names: Vec<String>,
}

impl NoteTemplate {
    pub fn new(name: impl Into<String>, field_names: Vec<String>) -> Self {
        Self { name: name.into(), field_names }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardTemplate {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Front")]
    pub qfmt: String,
    #[serde(rename = "Back")]
    pub afmt: String,
}

/// Everything `createModel` needs to build a note type from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDefinition {
    pub name: String,
    pub fields: Vec<String>,
    pub css: String,
    pub card_templates: Vec<CardTemplate>,
}

impl TemplateDefinition {
    pub fn flashcards() -> Self {
        Self {
            name: DEFAULT_TEMPLATE.to_string(),
            fields: vec!["Front".to_string(), "Back".to_string(), "Extra".to_string()],
            css: FLASHCARDS_CSS.to_string(),
            card_templates: vec![CardTemplate {
                name: "Card 1".to_string(),
                qfmt: "{{Front}}".to_string(),
                afmt: "{{FrontSide}}<hr id=answer><div class='back'>{{Back}}</div>\
                       {{#Extra}}<div class='extra'>{{Extra}}</div>{{/Extra}}"
                    .to_string(),
            }],
        }
    }

    pub fn basic() -> Self {
        Self {
            name: FALLBACK_TEMPLATE.to_string(),
            fields: vec!["Frente".to_string(), "Verso".to_string()],
            css: BASIC_CSS.to_string(),
            card_templates: vec![CardTemplate {
                name: "Card 1".to_string(),
                qfmt: "{{Frente}}".to_string(),
                afmt: "{{Frente}}<hr id=answer>{{Verso}}".to_string(),
            }],
        }
    }

    /// Definitions this crate knows how to create when Anki lacks them.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            DEFAULT_TEMPLATE => Some(Self::flashcards()),
            FALLBACK_TEMPLATE => Some(Self::basic()),
            _ => None,
        }
    }

    /// Simpler definition to try when this one cannot be created.
    pub fn fallback(&self) -> Option<Self> {
        match self.name.as_str() {
            DEFAULT_TEMPLATE => Some(Self::basic()),
            _ => None,
        }
    }
}

const FLASHCARDS_CSS: &str = ".card {
  font-family: Arial, sans-serif;
  font-size: 20px;
  text-align: center;
  color: black;
  background-color: white;
  padding: 20px;
}
.back {
  margin-top: 10px;
}
.extra {
  font-size: 16px;
  color: #555;
  margin-top: 15px;
  border-top: 1px solid #ddd;
  padding-top: 10px;
}";

const BASIC_CSS: &str = ".card {
  font-family: arial;
  font-size: 20px;
  text-align: center;
  color: black;
  background-color: white;
}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        };
        write!(f, "{}", label)
    }
}

/// One generated flashcard, as handed over by whatever produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub front: String,
    pub back: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
}

impl ContentRecord {
    pub fn new(front: impl Into<String>, back: impl Into<String>) -> Self {
        Self { front: front.into(), back: back.into(), ..Default::default() }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Trimmed `extra`, if there is any.
    pub fn extra_text(&self) -> Option<&str> {
        self.extra.as_deref().map(str::trim).filter(|extra| !extra.is_empty())
    }

    /// Short label for log lines and per-item errors.
    pub fn preview(&self) -> String {
        let source = [self.front.as_str(), self.back.as_str(), self.extra_text().unwrap_or("")]
            .into_iter()
            .map(str::trim)
            .find(|text| !text.is_empty())
            .unwrap_or("<empty>");

        let mut preview: String = source.chars().take(40).collect();
        if source.chars().count() > 40 {
            preview.push('…');
        }
        preview
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteOptions {
    pub allow_duplicate: bool,
    pub duplicate_scope: String,
}

impl Default for NoteOptions {
    fn default() -> Self {
        Self { allow_duplicate: false, duplicate_scope: "deck".to_string() }
    }
}

/// A note shaped exactly as `addNote`/`addNotes` expect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeNote {
    pub deck_name: String,
    pub model_name: String,
    pub fields: HashMap<String, String>,
    pub tags: Vec<String>,
    pub options: NoteOptions,
}
