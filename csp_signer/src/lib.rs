//! Wrapper crate around an external CMS signing tool (CryptoPro `csptest`).
//!
//! Nothing cryptographic happens in-process. The payload is staged in a
//! temporary file, the tool is run as a child process and asked for a
//! detached, base64 encoded PKCS#7 signature with the certificate chain
//! attached, and its output file is read back with all whitespace removed.
//!

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use tempfile::{Builder, TempPath};
use thiserror::Error;
use tracing::{debug, warn};

/// Where CryptoPro CSP installs `csptest` on 64-bit Linux.
pub const DEFAULT_CSPTEST_PATH: &str = "/opt/cprocsp/bin/amd64/csptest";

/// Errors raised while producing a signature.
#[derive(Debug, Error)]
pub enum SignError {
    /// The signer binary could not be started at all.
    #[error("failed to launch signer {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The signer ran and exited unsuccessfully. `stderr` is kept verbatim.
    #[error("signer exited with {status}: {stderr}")]
    Rejected { status: ExitStatus, stderr: String },

    /// Staging the payload or reading the result failed.
    #[error("signer temporary file error: {0}")]
    Io(#[from] io::Error),
}

/// A base64 encoded detached signature with all whitespace removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlob(String);

impl SignatureBlob {
    /// Normalizes raw signer output. The tool wraps base64 at a fixed column
    /// width, so line breaks and padding spaces are dropped.
    pub fn from_base64(raw: &str) -> Self {
        Self(strip_whitespace(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for SignatureBlob {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignatureBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Removes every ASCII whitespace character (space, tab, LF, VT, FF, CR).
pub fn strip_whitespace(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r'))
        .collect()
}

/// Anything able to produce a detached signature over a payload with the
/// certificate identified by `cert_id`.
pub trait DetachedSigner {
    fn sign(&self, payload: &[u8], cert_id: &str) -> Result<SignatureBlob, SignError>;
}

impl<S: DetachedSigner + ?Sized> DetachedSigner for &S {
    fn sign(&self, payload: &[u8], cert_id: &str) -> Result<SignatureBlob, SignError> {
        (**self).sign(payload, cert_id)
    }
}

impl<S: DetachedSigner + ?Sized> DetachedSigner for Box<S> {
    fn sign(&self, payload: &[u8], cert_id: &str) -> Result<SignatureBlob, SignError> {
        (**self).sign(payload, cert_id)
    }
}

/// Signs by spawning `csptest` once per call.
///
/// The command line is
/// `<program> <mode args> -in <input> -out <output> -my <cert_id> -base64 -add`
/// where the mode args default to `-sfsign -sign`.
#[derive(Debug, Clone)]
pub struct CspTestSigner {
    program: PathBuf,
    mode_args: Vec<OsString>,
}

impl Default for CspTestSigner {
    fn default() -> Self {
        Self::new(DEFAULT_CSPTEST_PATH)
    }
}

impl CspTestSigner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            mode_args: vec!["-sfsign".into(), "-sign".into()],
        }
    }

    /// Replaces the arguments placed before `-in`.
    pub fn with_mode_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.mode_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, input: &Path, output: &Path, cert_id: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.mode_args)
            .arg("-in")
            .arg(input)
            .arg("-out")
            .arg(output)
            .arg("-my")
            .arg(cert_id)
            .arg("-base64")
            .arg("-add")
            .stdin(Stdio::null());
        command
    }
}

impl DetachedSigner for CspTestSigner {
    fn sign(&self, payload: &[u8], cert_id: &str) -> Result<SignatureBlob, SignError> {
        // Both paths are removed when the guards drop, whichever way we leave.
        let input = stage_payload(payload)?;
        let output = Builder::new()
            .prefix("sign")
            .suffix(".txt")
            .tempfile()?
            .into_temp_path();

        debug!(
            program = %self.program.display(),
            cert = cert_id,
            bytes = payload.len(),
            "invoking signer"
        );

        let result = self
            .command(&input, &output, cert_id)
            .output()
            .map_err(|source| SignError::Spawn {
                path: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
            warn!(status = %result.status, "signer rejected the request");
            return Err(SignError::Rejected {
                status: result.status,
                stderr,
            });
        }

        let raw = std::fs::read_to_string(&output)?;
        let blob = SignatureBlob::from_base64(&raw);
        debug!(len = blob.as_str().len(), "signature produced");
        Ok(blob)
    }
}

fn stage_payload(payload: &[u8]) -> io::Result<TempPath> {
    let mut file = Builder::new().prefix("data").suffix(".txt").tempfile()?;
    file.write_all(payload)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

// ----------------------------------------------
//
// Unit tests
//
