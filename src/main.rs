//! Tool Gate - authenticate, authorize and audit tool calls.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, warn};

use tool_gate::{
    audit::MemorySink,
    auth::KeyCache,
    cli::{Cli, Command, KeysCommand, PolicyCommand},
    config::Config,
    gateway::Gateway,
    policy::{PolicyFile, PolicySet, ToolCallRequest},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Command::Whoami { token } => run_whoami(config_path, &token).await,
        Command::Check {
            token,
            tool,
            params,
            commit,
            confirmation,
        } => {
            let request = match build_request(tool, &params, commit, confirmation) {
                Ok(request) => request,
                Err(e) => {
                    eprintln!("❌ {e:#}");
                    return ExitCode::FAILURE;
                }
            };
            run_check(config_path, &token, &request).await
        }
        Command::Policy(cmd) => run_policy(config_path, cmd),
        Command::Keys(KeysCommand::Status) => run_keys_status(config_path).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_request(
    tool: String,
    params: &str,
    commit: bool,
    confirmation: Option<String>,
) -> anyhow::Result<ToolCallRequest> {
    let params = match serde_json::from_str::<Value>(params).context("--params is not valid JSON")? {
        Value::Object(map) => map,
        _ => bail!("--params must be a JSON object"),
    };
    Ok(ToolCallRequest {
        tool,
        params,
        commit,
        confirmation,
    })
}

/// Verify a credential and print the principal with secrets masked.
async fn run_whoami(config_path: Option<&Path>, token: &str) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    // Nothing is authorized here, so nothing goes to the real audit trail.
    let gateway = Gateway::from_config_with_sink(&config, Arc::new(MemorySink::new()))?;

    match gateway.authenticate(token, Utc::now()).await {
        Ok(mut principal) => {
            principal.claims = gateway.audit().redactor().redact_map(&principal.claims);
            print_json(&principal)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&json!({"authenticated": false, "error": e.kind()}))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Run one call through the gateway and print the decision.
async fn run_check(
    config_path: Option<&Path>,
    token: &str,
    request: &ToolCallRequest,
) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let gateway = Gateway::from_config(&config)?;

    match gateway.authorize(token, request, Utc::now()).await {
        Ok(authorized) => {
            print_json(&json!({
                "allowed": true,
                "decision": authorized.decision,
                "subject": authorized.principal.subject,
                "role": authorized.principal.role,
                "audit": {"seq": authorized.audit.seq, "hash": authorized.audit.hash},
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&json!({
                "allowed": false,
                "status": e.status_code(),
                "error": e.public_message(),
                "reason": e.reason(),
                "retriable": e.is_retriable(),
            }))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_policy(config_path: Option<&Path>, cmd: PolicyCommand) -> anyhow::Result<ExitCode> {
    let rules = match cmd {
        PolicyCommand::Validate { file: Some(file) } => {
            let policy = PolicyFile::load(&file)?;
            let set = PolicySet::new(policy.tools)?;
            println!("✅ {}: {} rule(s) valid", file.display(), set.len());
            return Ok(ExitCode::SUCCESS);
        }
        PolicyCommand::Validate { file: None } => {
            let set = PolicySet::from_config(&load_config(config_path)?.policy)?;
            println!("✅ {} rule(s) valid", set.len());
            return Ok(ExitCode::SUCCESS);
        }
        PolicyCommand::List => PolicySet::from_config(&load_config(config_path)?.policy)?,
    };

    if rules.is_empty() {
        warn!("No policy rules configured");
        println!("No rules configured: every call is denied.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<36} {:<10} {:<9} {:<8} SITE PARAM", "TOOL", "MIN ROLE", "MUTATING", "CONFIRM");
    for rule in rules.iter() {
        println!(
            "{:<36} {:<10} {:<9} {:<8} {}",
            rule.name,
            rule.min_role.to_string(),
            rule.mutating,
            rule.requires_confirmation,
            rule.site_param.as_deref().unwrap_or("-"),
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_keys_status(config_path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let cache = KeyCache::from_config(&config.auth)?;
    let now = Utc::now();

    let loaded = cache.prime(now).await;
    let status = cache.status(now);
    match loaded {
        Ok(keys) => {
            print_json(&json!({
                "status": status,
                "origin": keys.origin(),
                "fetched_at": keys.fetched_at(),
                "kids": keys.kids().collect::<Vec<_>>(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&json!({"status": status, "error": e.to_string()}))?;
            Ok(ExitCode::FAILURE)
        }
    }
}
