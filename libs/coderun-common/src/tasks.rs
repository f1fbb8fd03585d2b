use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::Language;

/// Task type tags. One tag per supported runtime.
pub const TYPE_COMPILE_PYTHON: &str = "compile:python";
pub const TYPE_COMPILE_GO: &str = "compile:go";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguageError(pub String);

/// Reasons a delivered task cannot be turned back into a payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected task type: {0}")]
    UnknownType(String),

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("task type {tag} does not match payload language {language}")]
    LanguageMismatch { tag: String, language: String },

    #[error(transparent)]
    Unsupported(#[from] UnsupportedLanguageError),
}

/// The execution inputs, snapshotted at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilePayload {
    pub execution_id: Uuid,
    pub language: Language,
    pub source_code: String,
}

/// Opaque unit handed to the broker. `id` is always the execution id so a
/// delivery can be traced back to its record even when the payload is
/// unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub payload: String,
}

pub fn type_tag(language: Language) -> &'static str {
    match language {
        Language::Python => TYPE_COMPILE_PYTHON,
        Language::Go => TYPE_COMPILE_GO,
    }
}

fn language_for_tag(tag: &str) -> Option<Language> {
    match tag {
        TYPE_COMPILE_PYTHON => Some(Language::Python),
        TYPE_COMPILE_GO => Some(Language::Go),
        _ => None,
    }
}

/// Build a compile task. Rejects unknown languages before anything is
/// serialized, so callers can bail out before touching storage.
pub fn new_compile_task(
    execution_id: Uuid,
    language: &str,
    source_code: &str,
) -> Result<Task, UnsupportedLanguageError> {
    let language: Language = language.parse()?;

    let payload = serde_json::json!({
        "execution_id": execution_id,
        "language": language,
        "source_code": source_code,
    })
    .to_string();

    Ok(Task {
        id: execution_id,
        type_tag: type_tag(language).to_string(),
        payload,
    })
}

impl Task {
    /// Decode the payload and check it against the type tag.
    pub fn decode(&self) -> Result<CompilePayload, DecodeError> {
        let expected = language_for_tag(&self.type_tag)
            .ok_or_else(|| DecodeError::UnknownType(self.type_tag.clone()))?;

        let raw: RawPayload = serde_json::from_str(&self.payload)?;
        let language: Language = raw.language.parse()?;
        if language != expected {
            return Err(DecodeError::LanguageMismatch {
                tag: self.type_tag.clone(),
                language: raw.language,
            });
        }

        Ok(CompilePayload {
            execution_id: raw.execution_id,
            language,
            source_code: raw.source_code,
        })
    }
}

#[derive(Deserialize)]
struct RawPayload {
    execution_id: Uuid,
    language: String,
    source_code: String,
}
