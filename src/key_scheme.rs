//! Mapping between an upload identifier plus chunk index and the storage key
//! a chunk lives under.
//!
//! Ingestion and merge must agree on which identifier is used. The scheme is
//! fixed for the lifetime of the process.

use serde::{Deserialize, Serialize};

pub const CHUNK_KEY_INFIX: &str = "-chunk-";
const MAX_IDENTIFIER_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    /// Chunks are ingested under the final file name; merge keys off
    /// `fileName`.
    FileName,
    /// Chunks are ingested under a client-generated session token; merge
    /// requires `uploadId` and uses `fileName` only to name the artifact.
    #[default]
    UploadId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl KeyScheme {
    /// Resolves the identifier chunks were ingested under for a merge
    /// request.
    pub fn merge_identifier(
        &self,
        file_name: &str,
        upload_id: Option<&str>,
    ) -> Result<String, IdentifierError> {
        validate_identifier("fileName", file_name)?;
        match self {
            KeyScheme::FileName => Ok(file_name.to_string()),
            KeyScheme::UploadId => {
                let upload_id = upload_id.ok_or(IdentifierError::Missing("uploadId"))?;
                validate_identifier("uploadId", upload_id)?;
                Ok(upload_id.to_string())
            }
        }
    }
}

pub fn chunk_key(id: &str, index: u64) -> String {
    format!("{}{}{}", id, CHUNK_KEY_INFIX, index)
}

/// Inverse of [`chunk_key`] for keys that belong to `id`.
pub fn parse_index(id: &str, key: &str) -> Option<u64> {
    let rest = key.strip_prefix(id)?.strip_prefix(CHUNK_KEY_INFIX)?;
    parse_canonical_index(rest)
}

/// Splits any chunk key into its identifier and index.
///
/// The index is the digits after the last infix, so identifiers that
/// themselves contain the infix still split correctly.
pub fn parse_chunk_key(key: &str) -> Option<(&str, u64)> {
    let (id, rest) = key.rsplit_once(CHUNK_KEY_INFIX)?;
    if id.is_empty() {
        return None;
    }
    Some((id, parse_canonical_index(rest)?))
}

fn parse_canonical_index(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = s.parse::<u64>().ok()?;
    // "007" is not a key this scheme ever writes.
    (index.to_string() == s).then_some(index)
}

/// Rejects identifiers that could escape their storage namespace.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Missing(field));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::Invalid {
            field,
            reason: "longer than 255 bytes",
        });
    }
    if value.starts_with('.') {
        return Err(IdentifierError::Invalid {
            field,
            reason: "must not start with '.'",
        });
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(IdentifierError::Invalid {
            field,
            reason: "must not contain path separators or control characters",
        });
    }
    Ok(())
}
