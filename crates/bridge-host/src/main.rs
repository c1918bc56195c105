//! Bridge Host
//!
//! Starts the demo embedded runtime, exchanges messages with it, runs a
//! pause/resume cycle and reports attachment pool statistics.

mod echo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bridge_runtime::{
    BridgeConfig, EVENTS_CHANNEL, HostBridge, InProcessVm, SYSTEM_CHANNEL, StartOptions, codec,
};

use crate::echo::EchoRuntime;

/// Host harness for the embedded runtime bridge
#[derive(Parser, Debug)]
#[command(name = "bridge-host")]
#[command(about = "Drive an embedded runtime over the channel bridge", long_about = None)]
struct Args {
    /// Path to a bridge.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the thread attachment limit
    #[arg(long)]
    limit: Option<usize>,

    /// Override the runtime module search path
    #[arg(long)]
    module_path: Option<String>,

    /// Pass the process's own stdout/stderr to the runtime
    #[arg(long)]
    no_redirect: bool,

    /// Number of messages to send
    #[arg(long, default_value = "3")]
    messages: usize,

    /// Native threads posting heartbeats from the runtime
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Seconds to wait for readiness and pause release
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Arguments passed to the runtime
    #[arg(last = true)]
    runtime_args: Vec<String>,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bridge_runtime=info,bridge_host=info,embedded=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("Starting bridge host v{}", env!("CARGO_PKG_VERSION"));

    let host = HostBridge::new(Arc::new(InProcessVm::new()), &config)?;
    info!(abi = host.abi_name(), limit = config.attach.limit, "Bridge created");

    host.register_channel(
        EVENTS_CHANNEL,
        Arc::new(|channel: &str, text: &str| match codec::deserialize(text) {
            Ok(envelope) => info!(
                channel = %channel,
                event = %envelope.event,
                payload = %serde_json::Value::Array(envelope.payload),
                "Received from runtime"
            ),
            Err(err) => warn!(channel = %channel, error = %err, "Undecodable message from runtime"),
        }),
    );
    host.register_channel(
        SYSTEM_CHANNEL,
        Arc::new(|_: &str, text: &str| info!(message = %text, "Lifecycle message")),
    );

    let mut options = StartOptions::from_config(&config.runtime);
    if !args.runtime_args.is_empty() {
        options.args = args.runtime_args.clone();
    }
    if options.args.is_empty() {
        options.args = vec!["bridge-host".to_string()];
    }

    let runtime = host.spawn_runtime(Arc::new(EchoRuntime::new(args.workers)), options)?;
    let timeout = Duration::from_secs(args.timeout);

    tokio::time::timeout(timeout, host.ready())
        .await
        .context("embedded runtime never signalled readiness")?;

    for i in 0..args.messages {
        let text = codec::serialize("message", [json!(format!("hello {i}")), json!(i)])?;
        host.send_message(EVENTS_CHANNEL, &text)?;
    }

    tokio::time::timeout(timeout, host.pause_and_wait())
        .await
        .context("pause was never released")??;
    info!("Runtime paused");
    host.resume()?;

    // Let trailing echoes arrive before shutting down.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = json!({
        "attachments": host.attachment_stats(),
        "registry": host.registry_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&stats)?);

    host.stop_runtime();
    let deadline = tokio::time::Instant::now() + timeout;
    while !runtime.is_finished() {
        if tokio::time::Instant::now() >= deadline {
            warn!("Embedded runtime slow to exit, waiting on join");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let code = tokio::task::spawn_blocking(move || runtime.join()).await??;
    info!(exit_code = code, "Embedded runtime finished");

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(limit) = args.limit {
        config.attach.limit = limit;
    }
    if let Some(module_path) = &args.module_path {
        config.runtime.module_path = module_path.clone();
    }
    if args.no_redirect {
        config.runtime.redirect_output = false;
    }

    config.validate()?;
    Ok(config)
}
