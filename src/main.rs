use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info};
use trueapi_submit::config::{FileConfig, Overrides};
use trueapi_submit::exchange::ReqwestExchange;
use trueapi_submit::{ConfigError, Orchestrator, Settings, WorkflowReport};

/// Signs in to True API with a CryptoPro certificate and submits a signed
/// document.
///
/// Common document types: LK_RECEIPT (withdrawal from circulation),
/// SETS_AGGREGATION (set formation).
#[derive(Parser, Debug)]
#[command(name = "trueapi-submit", version, about)]
struct Cli {
    /// Document to submit
    input: Option<PathBuf>,

    /// Serial number of the signing certificate in the personal store
    cert_serial: Option<String>,

    /// Document type, e.g. LK_RECEIPT
    document_type: Option<String>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Taxpayer id sent at sign-in
    #[arg(long, env = "TRUEAPI_INN")]
    inn: Option<String>,

    /// Service base URL
    #[arg(long, env = "TRUEAPI_BASE_URL")]
    base_url: Option<String>,

    /// Product group namespace for document creation
    #[arg(long)]
    product_group: Option<String>,

    /// Path to the csptest binary
    #[arg(long, env = "TRUEAPI_SIGNER")]
    signer: Option<PathBuf>,

    /// Query the document status after submission
    #[arg(long)]
    poll_status: bool,

    /// Wait before the status query, in milliseconds
    #[arg(long)]
    settle_delay_ms: Option<u64>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            base_url: self.base_url.clone(),
            product_group: self.product_group.clone(),
            cert_serial: self.cert_serial.clone(),
            document_type: self.document_type.clone(),
            input: self.input.clone(),
            inn: self.inn.clone(),
            signer_path: self.signer.clone(),
            poll_status: self.poll_status,
            settle_delay_ms: self.settle_delay_ms,
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("trueapi_submit=debug,csp_signer=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("trueapi_submit=info,csp_signer=warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = match &cli.config {
        Some(path) => FileConfig::load(path),
        None => FileConfig::load_default(),
    };
    let file = match file {
        Ok(file) => file,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let settings = match Settings::resolve(file, cli.overrides()) {
        Ok(settings) => settings,
        Err(ConfigError::Missing(name)) => {
            println!("Missing {name}.");
            println!("{}", Cli::command().render_usage());
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let http = match ReqwestExchange::new(settings.request_timeout) {
        Ok(http) => http,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let signer = settings.signer.build();
    let orchestrator = Orchestrator::new(settings.workflow, http, signer);
    let workflow = orchestrator.config();
    info!(
        base_url = %workflow.base_url,
        document_type = %workflow.document_type,
        status_poll = workflow.status_poll.is_some(),
        "starting submission"
    );

    match orchestrator.run() {
        Ok(report) => {
            print_report(&report, cli.json);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("{} ({})", failure, failure.kind());
            if let Some(message) = failure.error.server_message() {
                eprintln!("Server message: {message}");
            }
            ExitCode::FAILURE
        }
    }
}

fn print_report(report: &WorkflowReport, as_json: bool) {
    if as_json {
        match serde_json::to_string_pretty(report) {
            Ok(text) => println!("{text}"),
            Err(e) => error!("cannot serialize report: {}", e),
        }
        return;
    }

    println!("Document uid: {}", report.doc_uid);
    if let Some(status) = &report.status {
        println!("Status code: {}", status.status_code);
        println!("Response: {}", status.body);
    }
}
