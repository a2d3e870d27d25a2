//! aonp CLI binary
//!
//! Minimal entrypoint; all logic is in the library, main.rs only invokes
//! cli::run() and maps failure to the process exit code.

#[tokio::main]
async fn main() {
    if let Err(err) = aonp::cli::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
