mod tcp;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ftl_core::{NetConfig, SelfNode, Universe};
use tcp::TcpConnector;

struct Args {
    listen: Option<String>,
    connect: Option<String>,
    stream: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut listen = None;
    let mut connect = None;
    let mut stream = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                if i + 1 < args.len() {
                    listen = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--connect" | "-c" => {
                if i + 1 < args.len() {
                    connect = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--stream" | "-s" => {
                if i + 1 < args.len() {
                    stream = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "-h" | "--help" => {
                println!("ftl-demo - exercises the Self/Node facade's create_stream/connect_node");
                println!();
                println!("USAGE:");
                println!("    ftl-demo --listen tcp://0.0.0.0:9001");
                println!("    ftl-demo --connect tcp://127.0.0.1:9001 --stream ftl://demo/colour");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    Args { listen, connect, stream }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();

    let universe = Universe::new(Uuid::new_v4(), NetConfig::default());
    let node = SelfNode::new(universe.clone(), Arc::new(TcpConnector), NetConfig::default());

    node.on_node_details(|| serde_json::json!({"id": "ftl-demo", "title": "ftl-demo node"}));
    node.on_restart(|| tracing::info!("restart requested (demo: no-op)"));
    node.on_shutdown(|| tracing::info!("shutdown requested (demo: no-op)"));

    let _connect_handle = node.on_connect(|peer| {
        tracing::info!(uri = %peer.uri(), id = ?peer.id(), "node connected");
        true
    });
    let _disconnect_handle = node.on_disconnect(|peer| {
        tracing::info!(uri = %peer.uri(), "node disconnected");
        true
    });

    if let Some(addr) = &args.listen {
        node.listen(addr).await.context("failed to listen")?;
        tracing::info!(uri = %addr, "listening");
    }

    if let Some(target) = &args.connect {
        let peer = node.connect_node(target).await.context("failed to connect")?;
        peer.wait_connection(5).await;
        tracing::info!(uri = %target, connected = peer.is_connected(), "connected to node");

        if let Some(uri) = &args.stream {
            let stream = node.create_stream(uri).context("failed to create stream")?;
            tracing::info!(%uri, "stream created");
            drop(stream);
        }
    }

    if args.listen.is_none() && args.connect.is_none() {
        tracing::warn!("no --listen or --connect given, nothing to do (see --help)");
        return Ok(());
    }

    universe.start_periodic();
    tokio::signal::ctrl_c().await.ok();
    node.shutdown_self().await;
    Ok(())
}
