//! Binds a security policy digest into a key release policy template
//!
//! Run at deployment time, before the service exists. Safe to re-run: a
//! template that already carries the digest is left untouched.
//!
//! Exit codes:
//!   0 - bound, already bound, or no placeholder in advisory mode
//!   1 - unreadable input, or no placeholder with --strict

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use tee_attest::policy::{
    BindOutcome, PlaceholderMode, PolicyBinder, PolicyDocument, POLICY_HASH_PLACEHOLDER,
};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    if let Err(e) = tee_attest::init_tracing("info") {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let matches = command().get_matches();
    let result = run(&matches);
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    ExitCode::from(exit_status(&result))
}

fn exit_status(result: &Result<BindOutcome>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn command() -> Command {
    Command::new("bind-policy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Write the SHA-256 digest of a security policy into a release policy template")
        .arg(
            Arg::new("policy")
                .long("policy")
                .value_name("FILE")
                .help("Security policy, base64 encoded unless --raw is given")
                .required(true),
        )
        .arg(
            Arg::new("template")
                .long("template")
                .value_name("FILE")
                .help("Release policy template, bound in place unless --output is given")
                .required(true),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("FILE")
                .help("Write the bound template here instead of in place"),
        )
        .arg(
            Arg::new("placeholder")
                .long("placeholder")
                .value_name("TOKEN")
                .help("Token to replace with the digest")
                .default_value(POLICY_HASH_PLACEHOLDER),
        )
        .arg(
            Arg::new("raw")
                .long("raw")
                .help("Hash the policy file bytes as they are")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .help("Fail when the template has no placeholder to fill")
                .action(ArgAction::SetTrue),
        )
}

fn run(matches: &ArgMatches) -> Result<BindOutcome> {
    let policy_path = matches
        .get_one::<String>("policy")
        .map(PathBuf::from)
        .context("--policy is required")?;
    let template_path = matches
        .get_one::<String>("template")
        .map(PathBuf::from)
        .context("--template is required")?;
    let output_path = matches
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| template_path.clone());
    let placeholder = matches
        .get_one::<String>("placeholder")
        .cloned()
        .unwrap_or_else(|| POLICY_HASH_PLACEHOLDER.to_string());
    let mode = if matches.get_flag("strict") {
        PlaceholderMode::Strict
    } else {
        PlaceholderMode::Advisory
    };

    let policy = if matches.get_flag("raw") {
        let bytes = std::fs::read(&policy_path)
            .with_context(|| format!("Failed to read {}", policy_path.display()))?;
        PolicyDocument::from_bytes(bytes)
    } else {
        let encoded = std::fs::read_to_string(&policy_path)
            .with_context(|| format!("Failed to read {}", policy_path.display()))?;
        PolicyDocument::from_base64(&encoded)?
    };

    info!(
        policy = %policy_path.display(),
        template = %template_path.display(),
        policy_len = policy.bytes().len(),
        "Binding policy digest"
    );

    let binder = PolicyBinder::new(placeholder, mode);
    let artifact = binder
        .bind_file_to(&policy, &template_path, &output_path)
        .with_context(|| format!("Failed to bind {}", template_path.display()))?;

    match artifact.outcome {
        BindOutcome::Bound { replacements } => {
            info!(output = %output_path.display(), replacements, "Template bound");
        }
        BindOutcome::AlreadyBound => info!("Template already bound, nothing to do"),
        BindOutcome::Unbound => warn!(
            "Template has no {} placeholder; set the digest manually",
            binder.placeholder()
        ),
    }

    println!("{}", artifact.digest);
    Ok(artifact.outcome)
}
