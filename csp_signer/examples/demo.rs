use csp_signer::{CspTestSigner, DetachedSigner};

fn main() {
    // usage: cargo run --example demo -- <cert serial> [csptest path]
    let mut args = std::env::args().skip(1);
    let Some(cert) = args.next() else {
        eprintln!("usage: demo <cert serial> [csptest path]");
        return;
    };
    let signer = match args.next() {
        Some(path) => CspTestSigner::new(path),
        None => CspTestSigner::default(),
    };

    match signer.sign(b"Hello, World!", &cert) {
        Ok(signature) => println!("Detached signature: {}", signature),
        Err(e) => eprintln!("Signing failed: {}", e),
    }
}
