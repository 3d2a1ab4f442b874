use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use url::Url;

use config::app_config::load_config;
use http_probe::prelude::*;
use job::scheduler::Scheduler;
use metrics::{ProbeCounters, report_interval, spawn_reporter};
use sink::{HttpSink, LogSink, ResultSink};

pub mod config;
pub mod http_probe;
pub mod job;
pub mod metrics;
pub mod sink;

#[derive(Debug, Parser)]
#[command(name = "pulsebox", version, about = "HTTP(S) availability checking agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the configured checks on their polling intervals (default).
    Start,

    /// Run a single check and print the result.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// URL to check.
    url: String,

    #[arg(long, default_value = "GET")]
    method: String,

    #[arg(long, default_value_t = 15_000)]
    timeout_ms: u64,

    #[arg(long)]
    no_get_fallback: bool,

    #[arg(long)]
    ignore_tls_errors: bool,

    #[arg(long)]
    no_follow_redirects: bool,

    /// DNS servers to use, comma separated.
    #[arg(long, env = "DNS_HOSTS", default_value = "")]
    dns_hosts: String,
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start().await,
        Command::Check(args) => check(args).await,
    }
}

async fn start() -> anyhow::Result<()> {
    init_logging("info");

    let app_config = load_config().context("Failed to load configuration")?;

    let counters = Arc::new(ProbeCounters::new());
    let engine = ProbeEngine::new(
        EngineSettings {
            dns_hosts: app_config.dns_hosts.clone(),
            extra_roots: Vec::new(),
            use_native_roots: true,
        },
        counters.clone(),
    )
    .context("Failed to set up probe engine")?;

    let sink: Arc<dyn ResultSink> = match &app_config.result_endpoint {
        Some(endpoint) => {
            log::info!("Sending results to {endpoint}");
            Arc::new(HttpSink::new(endpoint.clone()).context("Failed to set up result sink")?)
        }
        None => {
            log::info!("No RESULT_ENDPOINT configured, logging results");
            Arc::new(LogSink)
        }
    };

    spawn_reporter(counters, report_interval(&app_config.app_env));

    let scheduler = Scheduler::new(engine, sink, app_config.max_org_width);
    for (name, organisation) in app_config.config {
        log::info!(
            "Scheduling {} targets for {name} every {}s",
            organisation.targets.len(),
            organisation.polling_interval_seconds
        );
        scheduler.spawn(&name, organisation);
    }

    // Keep main thread alive
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

async fn check(args: CheckArgs) -> anyhow::Result<()> {
    init_logging("debug");

    let url = Url::parse(&args.url)
        .ok()
        .filter(|url| url.host_str().is_some_and(|h| !h.is_empty()))
        .with_context(|| format!("Invalid URL {:?}", args.url))?;
    let method = args
        .method
        .parse::<http::Method>()
        .with_context(|| format!("Invalid method {:?}", args.method))?;

    let request = CheckRequest::new("-1", method, url, Duration::from_millis(args.timeout_ms))
        .with_options(CheckOptions {
            get_fallback: !args.no_get_fallback,
            ignore_tls_errors: args.ignore_tls_errors,
            follow_redirects: !args.no_follow_redirects,
        });

    let engine = ProbeEngine::new(
        EngineSettings {
            dns_hosts: config::app_config::parse_dns_hosts(&args.dns_hosts),
            extra_roots: Vec::new(),
            use_native_roots: true,
        },
        Arc::new(ProbeCounters::new()),
    )
    .context("Failed to set up probe engine")?;

    let mut result = engine.execute(&request).await;
    if result.success() {
        log::info!("Website is UP");
    } else {
        log::info!("Website is DOWN error={}", result.error_code());
    }

    // Remove body from output
    result.body.clear();
    println!("{result:#?}");
    Ok(())
}
