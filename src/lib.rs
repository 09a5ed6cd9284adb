//! True API submission client
//!
//! Signs in to the marking service with a challenge signed by an external
//! CryptoPro tool, submits a signed business document and optionally checks
//! its processing status.
//!
//! - [`extract::extract`] pulls scalar strings out of service responses
//! - [`exchange`] performs single HTTP request/response cycles
//! - [`workflow::Orchestrator`] sequences the steps
//! - [`submit`] wires the default network client and signer together

pub mod config;
pub mod error;
pub mod exchange;
pub mod extract;
pub mod model;
pub mod workflow;

pub use config::{Settings, WorkflowConfig};
pub use error::{ConfigError, ErrorKind, Step, WorkflowError, WorkflowFailure};
pub use model::{StatusReport, WorkflowReport, WorkflowState};
pub use workflow::Orchestrator;

use std::error::Error;

use exchange::ReqwestExchange;

/// Runs the whole workflow with `reqwest` and the configured `csptest`.
///
/// # Example
/// ```no_run
/// # use trueapi_submit::{submit, Settings, config::{FileConfig, Overrides}};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let overrides = Overrides {
///     input: Some("receipt.json".into()),
///     cert_serial: Some("01a2b3c4".into()),
///     document_type: Some("LK_RECEIPT".into()),
///     ..Default::default()
/// };
/// let settings = Settings::resolve(FileConfig::default(), overrides)?;
/// let report = submit(&settings)?;
/// println!("Submitted as {}", report.doc_uid);
/// # Ok(()) }
/// ```
pub fn submit(settings: &Settings) -> Result<WorkflowReport, Box<dyn Error>> {
    let http = ReqwestExchange::new(settings.request_timeout)?;
    let signer = settings.signer.build();
    let report = Orchestrator::new(settings.workflow.clone(), http, signer).run()?;
    Ok(report)
}
