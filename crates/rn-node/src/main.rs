//! rn-node demo
//!
//! Runs a talker, a listener and an `add_two_ints` service in one process
//! against the in-process registry.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rn_core::config::{self, NodeConfig};
use rn_core::msgs::{AddTwoInts, AddTwoIntsRequest, AddTwoIntsResponse, StdString};
use rn_node::{init_node, AdvertiseOptions, LocalRegistry, Node, SubscribeOptions};

#[derive(Parser)]
#[command(name = "rn-node")]
#[command(about = "rn talker/listener demo")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Topic to publish on
    #[arg(short, long, default_value = "chatter")]
    topic: String,

    /// Messages per second
    #[arg(short, long, default_value_t = 2.0)]
    rate: f64,

    /// Stop after this many messages (0 runs until Ctrl+C)
    #[arg(short = 'n', long, default_value_t = 10)]
    count: u64,

    /// Append a unique suffix to node names
    #[arg(long)]
    anonymous: bool,

    /// Print the talker's publications as JSON on exit
    #[arg(long)]
    json: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_node_config(path: Option<&PathBuf>) -> Result<NodeConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            NodeConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(NodeConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_node_config(args.config.as_ref())?;
    config.anonymous |= args.anonymous;

    let registry = LocalRegistry::new(config.master_uri.clone());

    let talker = init_node("talker", config.clone(), registry.clone(), registry.clone())
        .await
        .context("Failed to start talker")?;
    let listener = Node::start("listener", config, registry.clone(), registry.clone())
        .await
        .context("Failed to start listener")?;

    talker.wait_for_master().await?;

    let _server = talker.advertise_service::<AddTwoInts, _>("add_two_ints", |req: AddTwoIntsRequest| {
        Ok(AddTwoIntsResponse { sum: req.a + req.b })
    })?;

    let _subscriber = listener.subscribe::<StdString, _>(
        &args.topic,
        SubscribeOptions::default(),
        |msg: StdString| {
            tracing::info!("I heard: [{}]", msg.data);
            Ok(())
        },
    )?;

    let publisher = talker.advertise::<StdString>(&args.topic, AdvertiseOptions::default())?;
    let client = listener.service_client::<AddTwoInts>("add_two_ints")?;

    let shutdown = {
        let talker = talker.clone();
        let listener = listener.clone();
        tokio::spawn(async move {
            let _ = rn_node::shutdown_on_signal(talker).await;
            listener.shutdown().await;
        })
    };

    let period = Duration::from_secs_f64(1.0 / args.rate.max(0.001));
    let mut interval = tokio::time::interval(period);
    let mut sent = 0u64;
    while (args.count == 0 || sent < args.count) && !talker.is_shutdown() {
        interval.tick().await;
        let text = format!("hello world {}", sent);
        tracing::info!("{}", text);
        publisher.publish(StdString::new(text));

        match client
            .call(AddTwoIntsRequest {
                a: sent as i64,
                b: 1,
            })
            .await
        {
            Ok(response) => tracing::debug!("add_two_ints({}, 1) = {}", sent, response.sum),
            Err(e) => tracing::warn!("add_two_ints call failed: {}", e),
        }
        sent += 1;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&talker.publications())?);
    }

    shutdown.abort();
    listener.shutdown().await;
    talker.shutdown().await;

    Ok(())
}
