use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use peerbus::{
    ClientApi, ClientConfig, ErrorCode, IndexClient, IndexServer, IndexServerConfig, IndexService, NodeConfig,
    PeerNode, DEFAULT_INDEX_PORT,
};

const DEFAULT_INDEX_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_INDEX_PORT);

#[derive(Parser, Debug)]
#[command(name = "peerbus")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the indexing server.
    IndexServer {
        #[arg(short, long, default_value_t = DEFAULT_INDEX_ADDR)]
        bind: SocketAddr,
    },
    /// Run a peer node.
    Peer {
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        host: IpAddr,

        /// UDP port; a random port in 5000-6000 when omitted.
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, default_value_t = DEFAULT_INDEX_ADDR)]
        index: SocketAddr,

        /// Do not acknowledge new subscriptions.
        #[arg(long)]
        no_ack: bool,

        /// Stay registered with the index after exiting.
        #[arg(long)]
        keep_registration: bool,
    },
    /// Run an interactive client.
    Client {
        #[arg(short, long, default_value_t = 6000)]
        port: u16,

        #[arg(short, long, default_value_t = DEFAULT_INDEX_ADDR)]
        index: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::IndexServer { bind } => run_index_server(bind).await,
        Command::Peer { host, port, index, no_ack, keep_registration } => {
            let config = NodeConfig {
                host,
                port,
                index_server: index,
                ack_subscriptions: !no_ack,
                unregister_on_shutdown: !keep_registration,
                ..NodeConfig::default()
            };
            run_peer(config).await
        }
        Command::Client { port, index } => run_client(port, index).await,
    }
}

async fn run_index_server(bind: SocketAddr) -> Result<()> {
    let server = IndexServer::bind(IndexServerConfig { bind }).await?;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, exiting gracefully");
        }
        signal.cancel();
    });

    server.run(shutdown).await
}

async fn run_peer(config: NodeConfig) -> Result<()> {
    let mut node = PeerNode::bind(config).await?;
    info!(peer_id = %node.peer_id(), addr = %node.local_addr(), "Peer node ready");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal, exiting gracefully");
    node.shutdown().await;
    Ok(())
}

async fn run_client(port: u16, index: SocketAddr) -> Result<()> {
    let config = ClientConfig { port: Some(port), ..ClientConfig::default() };
    let mut client = ClientApi::connect(config, index).await?;
    client.start_receiving();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting gracefully");
        }
        result = client_session(&mut client, &mut lines) => result?,
    }

    client.shutdown().await;
    Ok(())
}

async fn client_session(client: &mut ClientApi<IndexClient>, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    if !choose_peer(client, lines).await? {
        return Ok(());
    }

    println!("Commands: create <topic> | delete <topic> | sub <topic> | pub <topic> <message> | topics | messages | quit");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match (command, rest) {
            ("", _) => continue,
            ("quit", _) => break,
            ("create", topic) if !topic.is_empty() => {
                client.create_topic(topic).await?;
            }
            ("delete", topic) if !topic.is_empty() => {
                client.delete_topic(topic).await?;
            }
            ("sub", topic) if !topic.is_empty() => {
                client.subscribe(topic).await?;
            }
            ("pub", args) => match args.split_once(' ') {
                Some((topic, message)) => {
                    client.publish(topic, message.trim()).await?;
                }
                None => println!("usage: pub <topic> <message>"),
            },
            ("topics", _) => match client.index().get_topics().await {
                Ok(topics) if topics.is_empty() => println!("(no topics)"),
                Ok(topics) => topics.iter().for_each(|topic| println!("{topic}")),
                Err(e) => warn!(error = %e, "get_topics failed"),
            },
            ("messages", _) => {
                for envelope in client.received_messages() {
                    println!("{envelope:?}");
                }
            }
            _ => println!("unknown command: {line}"),
        }
    }
    Ok(())
}

/// List registered peers and let the user pick one. Returns `false` if no
/// peer was selected.
async fn choose_peer(client: &mut ClientApi<IndexClient>, lines: &mut Lines<BufReader<Stdin>>) -> Result<bool> {
    let peers = match client.index().get_peers().await {
        Ok(peers) => peers,
        Err(e) if e.code() == Some(ErrorCode::NoPeers) => {
            println!("No available peer nodes.");
            return Ok(false);
        }
        Err(e) => return Err(e).context("failed to list peers"),
    };

    let peers: Vec<_> = peers.into_iter().collect();
    for (i, (peer_id, addr)) in peers.iter().enumerate() {
        println!("{}. peer {peer_id} at {addr}", i + 1);
    }

    loop {
        println!("Select a peer node (1-{}):", peers.len());
        let Some(line) = lines.next_line().await? else {
            return Ok(false);
        };
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=peers.len()).contains(&n) => {
                let (peer_id, addr) = peers[n - 1].clone();
                client.select(peer_id, addr);
                return Ok(true);
            }
            _ => println!("Invalid choice."),
        }
    }
}
