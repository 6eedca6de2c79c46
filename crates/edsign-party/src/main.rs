//! edsign party node
//!
//! Command-line interface for one participant of a signing group:
//! identity management, long-term distributed key generation and
//! collaborative signing over TCP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};

use edsign_core::net::tcp::TcpGateway;
use edsign_core::store::{AcceptAll, FileStore, Store};
use edsign_core::{
    Event, Identity, LongtermProposal, Node, NodeConfig, Private, SignatureInfo,
};

/// edsign party - distributed Schnorr signing node
#[derive(Parser)]
#[command(name = "edsign-party")]
#[command(about = "Distributed Schnorr signing over Ed25519")]
#[command(version)]
struct Cli {
    /// Data directory for the identity and the long-term share
    #[arg(short, long, env = "EDSIGN_DIR", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a private identity bound to a listen address
    Generate {
        /// Address this node listens on, e.g. 127.0.0.1:7001
        #[arg(short, long)]
        address: String,
    },

    /// Run the long-term key generation with the group
    Keygen {
        /// Group file: ordered member identities and the threshold
        #[arg(short, long)]
        group: PathBuf,

        /// Propose the key; exactly one peer initiates
        #[arg(long)]
        initiate: bool,

        /// Key holder name recorded with the share
        #[arg(long, default_value = "")]
        full_name: String,

        /// Contact recorded with the share
        #[arg(long, default_value = "")]
        email: String,
    },

    /// Sign a message with the group
    Sign {
        /// Group file: ordered member identities and the threshold
        #[arg(short, long)]
        group: PathBuf,

        /// UTF-8 message to sign
        #[arg(short, long)]
        message: String,

        /// Request the signature; exactly one peer initiates
        #[arg(long)]
        initiate: bool,
    },

    /// Show the stored identity and share
    Info,
}

/// The public description of a signing group.
#[derive(Serialize, Deserialize)]
struct GroupFile {
    threshold: usize,
    members: Vec<Identity>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dest)?;

    match cli.command {
        Commands::Generate { ref address } => generate(&cli, address),
        Commands::Keygen { ref group, initiate, ref full_name, ref email } => {
            run_keygen(&cli, group, initiate, full_name, email).await
        }
        Commands::Sign { ref group, ref message, initiate } => {
            run_sign(&cli, group, message, initiate).await
        }
        Commands::Info => show_info(&cli),
    }
}

fn generate(cli: &Cli, address: &str) -> Result<()> {
    let private_path = cli.dest.join("private.json");
    if private_path.exists() {
        return Err(anyhow!("{} already exists", private_path.display()));
    }
    let private = Private::generate(address, &mut OsRng);
    std::fs::write(&private_path, serde_json::to_string_pretty(&private)?)?;
    let identity_path = cli.dest.join("identity.json");
    std::fs::write(&identity_path, serde_json::to_string_pretty(private.identity())?)?;

    info!(
        id = %private.identity().id,
        path = %identity_path.display(),
        "identity generated"
    );
    println!("Identity: {}", private.identity().id);
    println!("Share {} with the group members.", identity_path.display());
    Ok(())
}

async fn run_keygen(
    cli: &Cli,
    group: &Path,
    initiate: bool,
    full_name: &str,
    email: &str,
) -> Result<()> {
    let (node, mut events) = start_node(cli, group).await?;

    if initiate {
        node.start_new_longterm(LongtermProposal {
            full_name: full_name.to_string(),
            email: email.to_string(),
            extra: String::new(),
        })
        .await?;
    }

    loop {
        match events.recv().await.context("event stream closed")? {
            Event::LongtermReady { key_id } => {
                println!("Distributed public key: {key_id}");
                break;
            }
            Event::SessionFailed { error, .. } => {
                return Err(anyhow!("key generation failed: {error}"));
            }
            Event::SignatureReady { .. } => {}
        }
    }
    node.stop().await;
    Ok(())
}

async fn run_sign(cli: &Cli, group: &Path, message: &str, initiate: bool) -> Result<()> {
    let (node, mut events) = start_node(cli, group).await?;
    let share = node.longterm().context("no longterm share; run keygen first")?;

    if initiate {
        let (_, reply) = node
            .new_signature(SignatureInfo {
                key_id: share.key_id.clone(),
                kind: 0,
                message: message.as_bytes().to_vec(),
            })
            .await?;
        let signature = reply.await.context("signing session failed")?;
        println!("Signature: {}", hex::encode(&signature));
    } else {
        loop {
            match events.recv().await.context("event stream closed")? {
                Event::SignatureReady { signature, .. } => {
                    println!("Signature: {}", hex::encode(&signature));
                    break;
                }
                Event::SessionFailed { error, .. } => {
                    return Err(anyhow!("signing failed: {error}"));
                }
                Event::LongtermReady { .. } => {}
            }
        }
    }
    node.stop().await;
    Ok(())
}

fn show_info(cli: &Cli) -> Result<()> {
    let private = load_private(cli)?;
    println!("Identity: {}", private.identity().id);
    println!("Address:  {}", private.identity().address);

    match FileStore::new(cli.dest.join("longterm.json")).load_longterm() {
        Ok(Some(share)) => {
            println!("Key id:   {}", share.key_id);
            println!("Index:    {}", share.share.index);
            if !share.full_name.is_empty() {
                println!("Holder:   {} <{}>", share.full_name, share.email);
            }
        }
        Ok(None) => println!("No longterm share yet."),
        Err(e) => println!("Longterm share unreadable: {e}"),
    }
    Ok(())
}

async fn start_node(
    cli: &Cli,
    group: &Path,
) -> Result<(Node, tokio::sync::mpsc::UnboundedReceiver<Event>)> {
    let private = Arc::new(load_private(cli)?);
    let group: GroupFile = serde_json::from_str(
        &std::fs::read_to_string(group)
            .with_context(|| format!("cannot read group file {}", group.display()))?,
    )?;
    for member in &group.members {
        member
            .verify_self()
            .map_err(|e| anyhow!("member {} has a bad identity: {e}", member.short_id()))?;
    }

    info!(
        id = %private.identity().id,
        members = group.members.len(),
        threshold = group.threshold,
        "starting node"
    );

    let gateway = Arc::new(TcpGateway::new(private.clone()));
    let store = Arc::new(FileStore::new(cli.dest.join("longterm.json")));
    let (node, events) = Node::new(
        NodeConfig {
            private,
            list: group.members,
            threshold: group.threshold,
            dkg_timeout: Some(Duration::from_secs(60)),
        },
        gateway,
        store,
        Arc::new(AcceptAll),
    )
    .await?;
    Ok((node, events))
}

fn load_private(cli: &Cli) -> Result<Private> {
    let path = cli.dest.join("private.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read {}; run generate first", path.display()))?;
    Ok(serde_json::from_str(&json)?)
}
