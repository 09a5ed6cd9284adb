//! Demo: sign in to the sandbox, submit a receipt and check its status.
//!
//! cargo run --example submit -- <document.json> <cert serial> [document type]

use std::time::Duration;

use trueapi_submit::config::{FileConfig, Overrides};
use trueapi_submit::{Settings, submit};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(input), Some(cert_serial)) = (args.next(), args.next()) else {
        println!("usage: submit <document.json> <cert serial> [document type]");
        return Ok(());
    };

    let overrides = Overrides {
        input: Some(input.into()),
        cert_serial: Some(cert_serial),
        document_type: Some(args.next().unwrap_or_else(|| "LK_RECEIPT".to_string())),
        poll_status: true,
        ..Default::default()
    };
    let settings = Settings::resolve(FileConfig::load_default()?, overrides)?;
    println!(
        "Submitting to {} (status check after {:?})",
        settings.workflow.base_url,
        settings.workflow.status_poll.unwrap_or(Duration::ZERO)
    );

    // 1) challenge, 2) sign-in, 3) signed document, 4) status
    let report = submit(&settings)?;
    println!("Document uid: {}", report.doc_uid);
    if let Some(status) = report.status {
        println!("Status {}: {}", status.status_code, status.body);
    }

    Ok(())
}
