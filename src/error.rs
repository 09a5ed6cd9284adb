use std::fmt;
use std::io;
use std::path::PathBuf;

use signer::SignError;
use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::model::WorkflowState;

/// The transition being attempted when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchChallenge,
    SignChallenge,
    SignIn,
    ReadDocument,
    SignDocument,
    Submit,
    PollStatus,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchChallenge => "fetch challenge",
            Self::SignChallenge => "sign challenge",
            Self::SignIn => "sign in",
            Self::ReadDocument => "read document",
            Self::SignDocument => "sign document",
            Self::Submit => "submit document",
            Self::PollStatus => "poll status",
        };
        f.write_str(name)
    }
}

/// Coarse classification used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Signer,
    LocalIo,
    Connection,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport error",
            Self::Protocol => "protocol error",
            Self::Signer => "signer error",
            Self::LocalIo => "local i/o error",
            Self::Connection => "connection error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The service answered with a status the step does not accept.
    #[error("{step} returned status {status}: {body}")]
    Transport {
        step: Step,
        status: u16,
        body: String,
        /// `error_message` extracted from the body, submission only.
        message: Option<String>,
    },

    /// Status 200 but an expected field is absent.
    #[error("{step} response is missing `{field}`: {body}")]
    Protocol {
        step: Step,
        field: &'static str,
        body: String,
    },

    #[error("{step}: {source}")]
    Signer {
        step: Step,
        #[source]
        source: SignError,
    },

    #[error("{step}: cannot read {path}: {source}")]
    LocalIo {
        step: Step,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The request never produced a status, or could not be addressed.
    #[error("{step}: {source}")]
    Connection {
        step: Step,
        #[source]
        source: ExchangeError,
    },
}

impl WorkflowError {
    pub fn step(&self) -> Step {
        match self {
            Self::Transport { step, .. }
            | Self::Protocol { step, .. }
            | Self::Signer { step, .. }
            | Self::LocalIo { step, .. }
            | Self::Connection { step, .. } => *step,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Signer { .. } => ErrorKind::Signer,
            Self::LocalIo { .. } => ErrorKind::LocalIo,
            Self::Connection { .. } => ErrorKind::Connection,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The human-readable message the service put in its error body, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Transport { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

/// A run that stopped early. `reached` is the last state completed.
#[derive(Debug, Error)]
#[error("workflow stopped at {reached}: {error}")]
pub struct WorkflowFailure {
    pub reached: WorkflowState,
    #[source]
    pub error: WorkflowError,
}

impl WorkflowFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}
