//! ARMI Node -- command line operation, usually just for testing since hubs
//! are normally embedded in an application.
//!
//! Usage:
//!   armi-node start --demo             # Accept peers, register demo services
//!   armi-node call HOST:PORT WorldClock.getTime UTC
//!   armi-node subscribe HOST:PORT armi.demo.ClockTick --flavor 1sec
//!   armi-node stop HOST:PORT --pw secret

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use armi_node::demo;
use armi_node::protocol::Value;
use armi_node::{CallbackDelivery, Hub, HubConfig};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "armi-node", about = "ARMI peer-to-peer messaging hub")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "armi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept remote clients and run until stopped
    Start {
        /// Bind address; defaults to the config's listen_addr
        #[arg(short, long)]
        bind: Option<String>,
        /// Register the demo services and the 1s/5s clock publishers
        #[arg(long)]
        demo: bool,
        /// Password protecting the Server.shutdown method
        #[arg(long)]
        pw: Option<String>,
    },
    /// Ask a remote hub to shut down via its Server service
    Stop {
        /// Remote hub as host:port
        target: String,
        #[arg(long)]
        pw: Option<String>,
    },
    /// Invoke a method on a remote hub, e.g. WorldClock.getTime UTC
    Call {
        /// Remote hub as host:port
        target: String,
        /// Service and method as Service.method
        call: String,
        /// String arguments passed positionally
        args: Vec<String>,
    },
    /// Subscribe to a (type, flavor) key on a remote hub and print envelopes
    Subscribe {
        /// Remote hub as host:port
        target: String,
        /// Envelope type to subscribe to
        data_type: String,
        #[arg(long)]
        flavor: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "armi_node=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = HubConfig::load_or_default(&cli.config)?;
    let hub = Hub::new(config);

    match cli.command {
        Commands::Start { bind, demo, pw } => {
            let bind = match bind {
                Some(addr) => Some(resolve(&addr).await?),
                None => None,
            };
            let port = hub.accept_remote_clients(bind, None).await?;
            println!("Accepting remote clients on port {port}");
            if demo {
                hub.register_service("Server", Some(demo::server_service(hub.clone(), pw)))
                    .await?;
                println!("Registered service: Server");
                hub.register_service("WorldClock", Some(demo::world_clock_service())).await?;
                println!("Registered service: WorldClock");
                demo::spawn_date_publisher(hub.clone(), Duration::from_secs(1), "1sec");
                demo::spawn_date_publisher(hub.clone(), Duration::from_secs(5), "5sec");
            }
            wait_until_stopped(&hub).await;
        }
        Commands::Stop { target, pw } => {
            let target = resolve(&target).await?;
            let args = pw.map(|p| vec![Value::Str(p)]).unwrap_or_default();
            // The remote may tear the connection down mid-reply; that still
            // means the shutdown was accepted.
            match hub.call(target, "Server", "shutdown", args).await {
                Ok(v) => println!("{}", display(&v)),
                Err(e) => println!("No clean reply ({e}); the hub is likely shutting down."),
            }
            hub.shutdown().await;
        }
        Commands::Call { target, call, args } => {
            let target = resolve(&target).await?;
            let (service, method) = call
                .rsplit_once('.')
                .context("expected Service.method, e.g. WorldClock.getTime")?;
            let args = args.into_iter().map(Value::Str).collect();
            match hub.call(target, service, method, args).await {
                Ok(v) => println!("{}", display(&v)),
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
            hub.shutdown().await;
        }
        Commands::Subscribe { target, data_type, flavor } => {
            let target = resolve(&target).await?;
            let delivery = Arc::new(CallbackDelivery::new(
                |env| println!("Received {env} ({} payload bytes)", env.payload.len()),
                |reason| println!("Subscription aborted: {reason}"),
            ));
            let receipt = hub
                .subscribe(&data_type, flavor.as_deref(), None, delivery, Some(target))
                .await?;
            println!("Subscribed to {}; ctrl-c to cancel", &data_type);
            tokio::signal::ctrl_c().await?;
            receipt.cancel().await.ok();
            hub.shutdown().await;
        }
    }
    Ok(())
}

/// Resolve "host:port" via DNS, preferring IPv4-style first answers.
async fn resolve(target: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("cannot resolve {target:?}"))?
        .next()
        .with_context(|| format!("no address for {target:?}"))
}

/// Block until ctrl-c or until a remote shutdown call stops the hub.
async fn wait_until_stopped(hub: &Hub) {
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                hub.shutdown().await;
                break;
            }
            _ = poll.tick() => {
                if !hub.is_running() {
                    break;
                }
            }
        }
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::Null => "(void)".to_owned(),
        Value::Str(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bytes(b) => format!("({} bytes)", b.len()),
        Value::List(items) => items.iter().map(display).collect::<Vec<_>>().join(", "),
    }
}
