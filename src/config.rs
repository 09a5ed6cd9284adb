use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::exchange::ExchangeError;

pub const DEFAULT_BASE_URL: &str = "https://markirovka.sandbox.crptech.ru/api/v3/true-api";
pub const DEFAULT_PRODUCT_GROUP: &str = "petfood";
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1500;
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// The on-disk TOML file. Every key is optional; the command line fills in
/// or overrides whatever is missing.
///
/// ```toml
/// cert_serial = "01a2b3c4"
/// document_type = "LK_RECEIPT"
/// inn = "7700000000"
///
/// [signer]
/// path = "/opt/cprocsp/bin/amd64/csptest"
///
/// [status]
/// poll = true
/// settle_delay_ms = 1500
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub product_group: Option<String>,
    pub cert_serial: Option<String>,
    pub document_type: Option<String>,
    pub input: Option<PathBuf>,
    pub inn: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub signer: SignerSection,
    pub status: StatusSection,
    pub retry: RetrySection,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignerSection {
    pub path: Option<PathBuf>,
    pub mode_args: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSection {
    pub poll: Option<bool>,
    pub settle_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub get_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

impl FileConfig {
    /// `<config dir>/trueapi/config.toml`, e.g. `~/.config/trueapi/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("trueapi").join("config.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads the default file when it exists, otherwise starts empty.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub product_group: Option<String>,
    pub cert_serial: Option<String>,
    pub document_type: Option<String>,
    pub input: Option<PathBuf>,
    pub inn: Option<String>,
    pub signer_path: Option<PathBuf>,
    pub poll_status: bool,
    pub settle_delay_ms: Option<u64>,
}

/// Bounded retry for idempotent GET steps. One attempt means no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub get_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            get_attempts: 1,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`; doubles each time.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }
}

/// Everything the orchestrator needs, fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub base_url: String,
    pub product_group: String,
    pub cert_serial: String,
    pub document_type: String,
    pub input: PathBuf,
    /// Sent as `inn` at sign-in when present.
    pub tenant_inn: Option<String>,
    /// Settle delay before the status poll; `None` skips the poll.
    pub status_poll: Option<Duration>,
    pub retry: RetryPolicy,
}

impl WorkflowConfig {
    pub fn new(
        base_url: impl Into<String>,
        cert_serial: impl Into<String>,
        document_type: impl Into<String>,
        input: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            product_group: DEFAULT_PRODUCT_GROUP.to_string(),
            cert_serial: cert_serial.into(),
            document_type: document_type.into(),
            input: input.into(),
            tenant_inn: None,
            status_poll: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_tenant(mut self, inn: impl Into<String>) -> Self {
        self.tenant_inn = Some(inn.into());
        self
    }

    pub fn with_status_poll(mut self, settle_delay: Duration) -> Self {
        self.status_poll = Some(settle_delay);
        self
    }

    pub fn with_product_group(mut self, group: impl Into<String>) -> Self {
        self.product_group = group.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn auth_key_url(&self) -> String {
        self.endpoint("/auth/key")
    }

    pub fn sign_in_url(&self) -> String {
        self.endpoint("/auth/simpleSignIn")
    }

    pub fn create_document_url(&self) -> String {
        self.endpoint(&format!("/lk/documents/create?pg={}", self.product_group))
    }

    /// The uid is percent-encoded as a single path segment, so `/`, `?` and
    /// `#` in a server-issued uid cannot change the route.
    pub fn document_info_url(&self, doc_uid: &str) -> Result<String, ExchangeError> {
        let invalid = |reason: &str| ExchangeError::InvalidUrl {
            url: self.base_url.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("cannot be a base"))?
            .pop_if_empty()
            .extend(["doc", doc_uid, "info"]);
        Ok(url.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerConfig {
    pub path: PathBuf,
    pub mode_args: Option<Vec<String>>,
}

impl SignerConfig {
    pub fn build(&self) -> signer::CspTestSigner {
        let signer = signer::CspTestSigner::new(&self.path);
        match &self.mode_args {
            Some(args) => signer.with_mode_args(args),
            None => signer,
        }
    }
}

/// The merged result of file and command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workflow: WorkflowConfig,
    pub signer: SignerConfig,
    pub request_timeout: Option<Duration>,
}

impl Settings {
    /// Command line wins over file, file wins over built-in defaults.
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self, ConfigError> {
        let input = cli.input.or(file.input).ok_or(ConfigError::Missing("input"))?;
        let cert_serial = non_empty(cli.cert_serial.or(file.cert_serial))
            .ok_or(ConfigError::Missing("cert_serial"))?;
        let document_type = non_empty(cli.document_type.or(file.document_type))
            .ok_or(ConfigError::Missing("document_type"))?;

        let base_url = cli
            .base_url
            .or(file.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let parsed = Url::parse(&base_url).map_err(|e| ConfigError::Invalid {
            name: "base_url",
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ConfigError::Invalid {
                name: "base_url",
                reason: "not a hierarchical URL".to_string(),
            });
        }

        let product_group = cli
            .product_group
            .or(file.product_group)
            .unwrap_or_else(|| DEFAULT_PRODUCT_GROUP.to_string());

        let poll = cli.poll_status || file.status.poll.unwrap_or(false);
        let settle_delay_ms = cli
            .settle_delay_ms
            .or(file.status.settle_delay_ms)
            .unwrap_or(DEFAULT_SETTLE_DELAY_MS);

        let get_attempts = file.retry.get_attempts.unwrap_or(1);
        if get_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "retry.get_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        let retry = RetryPolicy {
            get_attempts,
            backoff: Duration::from_millis(file.retry.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS)),
        };

        let workflow = WorkflowConfig {
            base_url,
            product_group,
            cert_serial,
            document_type,
            input,
            tenant_inn: non_empty(cli.inn.or(file.inn)),
            status_poll: poll.then(|| Duration::from_millis(settle_delay_ms)),
            retry,
        };

        let signer = SignerConfig {
            path: cli
                .signer_path
                .or(file.signer.path)
                .unwrap_or_else(|| PathBuf::from(signer::DEFAULT_CSPTEST_PATH)),
            mode_args: file.signer.mode_args,
        };

        Ok(Self {
            workflow,
            signer,
            request_timeout: file.request_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
