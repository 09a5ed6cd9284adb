//! The sign-in and submission sequence.
//!
//! ```text
//! Init -> ChallengeFetched -> ChallengeSigned -> Authenticated
//!      -> DocumentRead -> DocumentSigned -> Submitted [-> StatusChecked]
//! ```
//!
//! Every step consumes what the previous one produced, so the run is strictly
//! sequential and blocking. Any failure ends the run with a [`WorkflowFailure`]
//! naming the last state reached. Only the idempotent GET steps may be
//! retried, and only when [`RetryPolicy::get_attempts`] is above one.
//!
//! [`RetryPolicy::get_attempts`]: crate::config::RetryPolicy

use std::thread;

use chrono::Utc;
use serde_json::json;
use signer::{DetachedSigner, SignatureBlob};
use tracing::{error, info, warn};

use crate::config::WorkflowConfig;
use crate::error::{Step, WorkflowError, WorkflowFailure};
use crate::exchange::{ExchangeRequest, ExchangeResponse, HttpExchange};
use crate::extract::extract;
use crate::model::{
    AuthSession, Challenge, DocumentPayload, StatusReport, SubmissionResult, WorkflowReport,
    WorkflowState,
};

/// Value of `document_format` on submission.
pub const DOCUMENT_FORMAT: &str = "MANUAL";

pub struct Orchestrator<H, S> {
    config: WorkflowConfig,
    http: H,
    signer: S,
}

impl<H: HttpExchange, S: DetachedSigner> Orchestrator<H, S> {
    pub fn new(config: WorkflowConfig, http: H, signer: S) -> Self {
        Self {
            config,
            http,
            signer,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs every step from `Init`. Nothing is carried over between runs.
    pub fn run(&self) -> Result<WorkflowReport, WorkflowFailure> {
        let started_at = Utc::now();

        let challenge = self
            .fetch_challenge()
            .map_err(|e| failed(WorkflowState::Init, e))?;
        info!(uuid = %challenge.uuid, "challenge fetched");

        let challenge_signature = self
            .sign(Step::SignChallenge, challenge.data.as_bytes())
            .map_err(|e| failed(WorkflowState::ChallengeFetched, e))?;
        info!("challenge signed");

        let session = self
            .sign_in(&challenge, &challenge_signature)
            .map_err(|e| failed(WorkflowState::ChallengeSigned, e))?;
        info!("bearer token obtained");

        let document = self
            .read_document()
            .map_err(|e| failed(WorkflowState::Authenticated, e))?;
        info!(
            path = %self.config.input.display(),
            bytes = document.compact().len(),
            "document read"
        );

        let document_signature = self
            .sign(Step::SignDocument, document.compact().as_bytes())
            .map_err(|e| failed(WorkflowState::DocumentRead, e))?;
        info!("document signed");

        let submission = self
            .submit(&session, &document, &document_signature)
            .map_err(|e| failed(WorkflowState::DocumentSigned, e))?;
        info!(doc_uid = %submission.doc_uid, "document submitted");

        let (final_state, status) = match self.config.status_poll {
            Some(settle_delay) => {
                info!(?settle_delay, "waiting before status check");
                thread::sleep(settle_delay);
                let report = self
                    .poll_status(&session, &submission)
                    .map_err(|e| failed(WorkflowState::Submitted, e))?;
                info!(status = report.status_code, "document status checked");
                (WorkflowState::StatusChecked, Some(report))
            }
            None => (WorkflowState::Submitted, None),
        };

        Ok(WorkflowReport {
            final_state,
            challenge_uuid: challenge.uuid,
            doc_uid: submission.doc_uid,
            status,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn fetch_challenge(&self) -> Result<Challenge, WorkflowError> {
        let step = Step::FetchChallenge;
        let request = ExchangeRequest::get(self.config.auth_key_url()).accept_json();
        let resp = self.get_with_retry(step, &request, true)?;
        if resp.status != 200 {
            return Err(WorkflowError::Transport {
                step,
                status: resp.status,
                body: resp.body,
                message: None,
            });
        }

        let uuid = require(step, &resp.body, "uuid")?;
        let data = require(step, &resp.body, "data")?;
        Ok(Challenge { uuid, data })
    }

    fn sign(&self, step: Step, payload: &[u8]) -> Result<SignatureBlob, WorkflowError> {
        self.signer
            .sign(payload, &self.config.cert_serial)
            .map_err(|source| WorkflowError::Signer { step, source })
    }

    fn sign_in(
        &self,
        challenge: &Challenge,
        signature: &SignatureBlob,
    ) -> Result<AuthSession, WorkflowError> {
        let step = Step::SignIn;
        let mut body = json!({
            "uuid": challenge.uuid,
            "data": signature.as_str(),
        });
        if let Some(inn) = &self.config.tenant_inn {
            body["inn"] = json!(inn);
        }

        let request =
            ExchangeRequest::post_json(self.config.sign_in_url(), body.to_string()).accept_json();
        let resp = self.send_once(step, &request)?;
        if resp.status != 200 {
            return Err(WorkflowError::Transport {
                step,
                status: resp.status,
                body: resp.body,
                message: None,
            });
        }

        require(step, &resp.body, "token").map(AuthSession::new)
    }

    fn read_document(&self) -> Result<DocumentPayload, WorkflowError> {
        DocumentPayload::read(&self.config.input).map_err(|source| WorkflowError::LocalIo {
            step: Step::ReadDocument,
            path: self.config.input.clone(),
            source,
        })
    }

    fn submit(
        &self,
        session: &AuthSession,
        document: &DocumentPayload,
        signature: &SignatureBlob,
    ) -> Result<SubmissionResult, WorkflowError> {
        let step = Step::Submit;
        let body = json!({
            "document_format": DOCUMENT_FORMAT,
            "product_document": document.encoded(),
            "type": self.config.document_type,
            "signature": signature.as_str(),
        });

        let request = ExchangeRequest::post_json(self.config.create_document_url(), body.to_string())
            .bearer(session.token());
        let resp = self.send_once(step, &request)?;
        if resp.status >= 400 {
            let message = extract(&resp.body, "error_message");
            return Err(WorkflowError::Transport {
                step,
                status: resp.status,
                body: resp.body,
                message,
            });
        }

        let doc_uid = resp.body.trim();
        if doc_uid.is_empty() {
            return Err(WorkflowError::Protocol {
                step,
                field: "document uid",
                body: resp.body,
            });
        }
        Ok(SubmissionResult {
            doc_uid: doc_uid.to_string(),
        })
    }

    fn poll_status(
        &self,
        session: &AuthSession,
        submission: &SubmissionResult,
    ) -> Result<StatusReport, WorkflowError> {
        let step = Step::PollStatus;
        let url = self
            .config
            .document_info_url(&submission.doc_uid)
            .map_err(|source| WorkflowError::Connection { step, source })?;
        let request = ExchangeRequest::get(url)
            .accept_json()
            .bearer(session.token());
        // The answer is reported as is, so a status code is never a reason to retry.
        let resp = self.get_with_retry(step, &request, false)?;
        Ok(StatusReport {
            status_code: resp.status,
            body: resp.body,
            checked_at: Utc::now(),
        })
    }

    fn send_once(
        &self,
        step: Step,
        request: &ExchangeRequest,
    ) -> Result<ExchangeResponse, WorkflowError> {
        self.http
            .exchange(request)
            .map_err(|source| WorkflowError::Connection { step, source })
    }

    fn get_with_retry(
        &self,
        step: Step,
        request: &ExchangeRequest,
        retry_server_errors: bool,
    ) -> Result<ExchangeResponse, WorkflowError> {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            let last = attempt >= policy.get_attempts;
            match self.http.exchange(request) {
                Ok(resp) if retry_server_errors && resp.status >= 500 && !last => {
                    warn!(%step, status = resp.status, attempt, "server error, retrying");
                }
                Ok(resp) => return Ok(resp),
                Err(e) if !last => {
                    warn!(%step, attempt, "request failed, retrying: {}", e);
                }
                Err(source) => return Err(WorkflowError::Connection { step, source }),
            }
            thread::sleep(policy.delay_after(attempt));
            attempt += 1;
        }
    }
}

fn require(step: Step, body: &str, field: &'static str) -> Result<String, WorkflowError> {
    extract(body, field).ok_or_else(|| WorkflowError::Protocol {
        step,
        field,
        body: body.to_string(),
    })
}

fn failed(reached: WorkflowState, error: WorkflowError) -> WorkflowFailure {
    error!(
        %reached,
        step = %error.step(),
        kind = %error.kind(),
        "workflow failed: {}",
        error
    );
    WorkflowFailure { reached, error }
}
