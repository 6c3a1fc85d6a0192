//! Remote attestation verifier
//!
//! Connects to a running service, calls its `attestation_status` tool and
//! prints a report.
//!
//! Exit codes:
//!   0 - the service runs in a TEE and all secrets are loaded
//!   1 - not verified, unreachable, or the service broke the status contract;
//!       the report's `Result:` line tells these apart

use clap::{value_parser, Arg, ArgAction, Command};
use std::process::ExitCode;
use std::time::Duration;
use tee_attest::verifier::{RemoteVerifier, VerifierConfig, DEFAULT_ENDPOINT};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = tee_attest::init_tracing("warn") {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let matches = Command::new("attest-verify")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify that a remote service runs in a TEE with all secrets loaded")
        .arg(
            Arg::new("endpoint")
                .value_name("URL")
                .help("Service endpoint")
                .default_value(DEFAULT_ENDPOINT),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECS")
                .help("Give up after this many seconds")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("5"),
        )
        .arg(
            Arg::new("require")
                .long("require")
                .value_name("NAME")
                .help("Secret that must be reported and loaded (repeatable)")
                .action(ArgAction::Append),
        )
        .get_matches();

    let endpoint = matches
        .get_one::<String>("endpoint")
        .cloned()
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let mut config = VerifierConfig::new(endpoint);
    if let Some(secs) = matches.get_one::<u64>("timeout") {
        config.timeout = Duration::from_secs(*secs);
    }
    config.required_secrets = matches
        .get_many::<String>("require")
        .map(|names| names.cloned().collect())
        .unwrap_or_default();

    let result = RemoteVerifier::new(config).verify().await;
    print!("{}", result);

    ExitCode::from(result.exit_code() as u8)
}
