use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::{CallContext, PolicyRule};

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Fixed-window rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive calls to an operation through the limiter
    Simulate {
        /// Operation to invoke
        #[arg(short, long, default_value = "test")]
        operation: String,

        /// Number of calls
        #[arg(short = 'n', long, default_value_t = 4)]
        calls: u32,

        /// Caller session identifier
        #[arg(short, long)]
        session: Option<String>,

        /// Raw connection address of the caller
        #[arg(long)]
        remote_addr: Option<String>,

        /// Request header as NAME=VALUE, may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// List registered policies
    Policies,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    if config.policies.is_empty() && config.policies_path.is_none() {
        warn!("No policies configured, registering the demo policy for 'test'");
        config.policies.push(demo_policy());
    }

    let limiter = config
        .build_limiter()
        .await
        .context("failed to build rate limiter")?;
    info!(
        policies = limiter.policies().len(),
        fail_mode = ?limiter.fail_mode(),
        "Rate limiter initialized"
    );

    match cli.command {
        Command::Policies => {
            let mut policies: Vec<_> = limiter.policies().iter().collect();
            policies.sort_by_key(|(operation, _)| *operation);
            for (operation, policy) in policies {
                println!(
                    "{}\tname={}\tquota={}/{}s\tkey_mode={:?}\tscope={:?}",
                    operation,
                    policy.resource_name(),
                    policy.quota(),
                    policy.window_secs(),
                    policy.key_mode(),
                    policy.scope()
                );
            }
        }
        Command::Simulate {
            operation,
            calls,
            session,
            remote_addr,
            headers,
        } => {
            let mut ctx = CallContext::new(operation.clone());
            if let Some(session) = session {
                ctx = ctx.session_id(session);
            }
            if let Some(addr) = remote_addr {
                ctx = ctx.remote_addr(addr);
            }
            for (name, value) in &headers {
                ctx = ctx.header(name, value.clone());
            }

            for call in 1..=calls {
                let outcome = limiter.intercept(&ctx, || async { operation.clone() }).await;
                match outcome {
                    Ok(result) => println!("call {}: admitted -> {}", call, result),
                    Err(e) => {
                        let body = serde_json::to_string(&e.response())?;
                        println!("call {}: rejected -> {}", call, body);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Mirrors the sample endpoint: three calls per minute on a static key.
fn demo_policy() -> PolicyRule {
    PolicyRule {
        operation: "test".to_string(),
        name: "测试".to_string(),
        key: "key".to_string(),
        period: 60,
        count: 3,
        limit_type: Default::default(),
        limit_range: Default::default(),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
