//! Artifacts threaded between the workflow steps.

use std::fmt;
use std::io;
use std::path::Path;

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signer::strip_whitespace;

/// Server-issued payload whose signature proves possession of the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub uuid: String,
    pub data: String,
}

/// Bearer credential obtained at sign-in. `Debug` never shows the token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    token: String,
}

impl AuthSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .finish()
    }
}

/// The business document, whitespace-stripped and base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPayload {
    compact: String,
    encoded: String,
}

impl DocumentPayload {
    /// Fails with `InvalidData` when the bytes are not UTF-8.
    pub fn from_bytes(raw: &[u8]) -> io::Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let compact = strip_whitespace(text);
        let encoded = general_purpose::STANDARD.encode(compact.as_bytes());
        Ok(Self { compact, encoded })
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// What gets signed.
    pub fn compact(&self) -> &str {
        &self.compact
    }

    /// What gets sent as `product_document`.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionResult {
    pub doc_uid: String,
}

/// Raw answer of the document-info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status_code: u16,
    pub body: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Init,
    ChallengeFetched,
    ChallengeSigned,
    Authenticated,
    DocumentRead,
    DocumentSigned,
    Submitted,
    StatusChecked,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a run that reached `Submitted` or `StatusChecked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub final_state: WorkflowState,
    pub challenge_uuid: String,
    pub doc_uid: String,
    pub status: Option<StatusReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
