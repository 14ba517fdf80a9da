//! CLI entry point: validate configurations and dry-run rewrite rules
//! against raw request files.

use anyhow::{Context, Result};
use auth_mutator::{apply_rules, strip_credentials, EngineConfig, HttpService, RequestSnapshot};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "auth-mutator")]
#[command(
    author,
    version,
    about = "Rule-based request mutation engine for authorization testing"
)]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Raw HTTP request file to run the rules against
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Target host for the request file
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Target port for the request file
    #[arg(long, default_value = "443")]
    port: u16,

    /// Treat the target as plain HTTP instead of HTTPS
    #[arg(long)]
    insecure: bool,

    /// Also print the unauthenticated variant
    #[arg(long)]
    unauth: bool,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate: bool,
}

const EXAMPLE_CONFIG: &str = r#"# Auth Mutator Configuration Example
version: "1"

settings:
  # Master switch
  enabled: true
  # Restrict processing to in-scope URLs
  only_in_scope: false
  # Apply rewrite rules to the live request
  auto_modify: true
  # Derive and send unauthenticated variants
  unauthenticated_testing: true
  # Base the unauthenticated variant on the rewritten request
  apply_rules_to_unauth: false
  # Non-invasive preview for proxy traffic
  preview_in_proxy: true
  # Log size bound
  max_log_entries: 1000

rules:
  # Swap the session for another role's session
  - name: "act-as-viewer"
    enabled: true
    operations:
      - kind: set_cookie_value_by_name
        match: { pattern: "session" }
        value: "viewer-session-token"
    target_role: "viewer"

  # Strip a custom privilege header
  - name: "drop-privilege-header"
    operations:
      - kind: remove_header_by_name
        match: { pattern: "X-Admin" }

highlight_rules:
  # Color rows where the unauthenticated variant was not rejected
  - name: "unauth-succeeded"
    color: "red"
    operator: all
    conditions:
      - part: status_code
        relationship: less_than
        value: "400"

roles:
  - name: "viewer"
    enabled: true
    tokens:
      - kind: cookie
        name: "session"
        value: "viewer-session-token"
"#;

fn print_example_config() {
    println!("{}", EXAMPLE_CONFIG);
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    if args.example_config {
        print_example_config();
        return Ok(());
    }

    let config = if let Some(config_path) = &args.config {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        if config_path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            EngineConfig::from_yaml(&content)?
        } else {
            EngineConfig::from_json(&content)?
        }
    } else {
        EngineConfig::default()
    };

    if args.validate {
        info!(
            rules = config.rules.len(),
            highlight_rules = config.highlight_rules.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    let Some(request_path) = &args.request else {
        info!(
            rules = config.rules.len(),
            "Configuration loaded; pass --request to dry-run the rules"
        );
        return Ok(());
    };

    let raw = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request file: {}", request_path.display()))?;
    let service = HttpService::new(args.host.clone(), args.port, !args.insecure);
    let request = RequestSnapshot::from_raw(service, &raw);

    let (rewritten, changed) = apply_rules(&request, &config.rules);
    if changed {
        info!(url = %request.url(), "rules changed the request");
    } else {
        info!(url = %request.url(), "rules left the request unchanged");
    }
    println!("{}", rewritten.to_text());

    if args.unauth {
        match strip_credentials(&rewritten) {
            Some(variant) => {
                println!("--- unauthenticated variant ---");
                println!("{}", variant.to_text());
            }
            None => info!("request carries no cookies; no unauthenticated variant"),
        }
    }

    Ok(())
}
