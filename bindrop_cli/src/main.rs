use anyhow::{Context, Result};
use bindrop_core::utils::format_size;
use bindrop_core::{Client, ClientConfig, ClientEvent, ClientHandle, DownloadDirSink, RelayConfig};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bindrop")]
#[command(about = "End-to-end encrypted file drop through a relay")]
#[command(version)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay
    Relay {
        #[arg(long)]
        bind: Option<IpAddr>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Write the effective settings back to the config file
        #[arg(long)]
        save: bool,
    },

    /// Send a file or folder to the peer holding `code`
    Send {
        code: String,
        path: PathBuf,

        #[command(flatten)]
        relay: RelayArgs,
    },

    /// Print our code and accept everything that arrives
    Receive {
        /// Output directory (default: configured download directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit after the first completed transfer
        #[arg(long)]
        once: bool,

        #[command(flatten)]
        relay: RelayArgs,
    },
}

#[derive(clap::Args)]
struct RelayArgs {
    /// Relay host
    #[arg(long)]
    host: Option<String>,

    /// Relay port
    #[arg(long)]
    port: Option<u16>,
}

impl RelayArgs {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Relay { bind, port, save } => run_relay(bind, port, save).await,
        Commands::Send { code, path, relay } => {
            let mut config = ClientConfig::load();
            relay.apply(&mut config);
            run_send(config, code, path).await
        }
        Commands::Receive {
            output,
            once,
            relay,
        } => {
            let mut config = ClientConfig::load();
            relay.apply(&mut config);
            if let Some(output) = output {
                config.download_dir = output;
            }
            run_receive(config, once).await
        }
    }
}

async fn run_relay(bind: Option<IpAddr>, port: Option<u16>, save: bool) -> Result<()> {
    let mut config = RelayConfig::load();
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if save {
        config.save();
    }

    let handle = bindrop_core::relay::start(config).await?;
    println!("Relay listening on {}", handle.addr);

    let shutdown = handle.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        _ = shutdown.cancelled() => {}
    }
    handle.shutdown().await;
    Ok(())
}

async fn connect(config: ClientConfig) -> Result<(ClientHandle, mpsc::Receiver<ClientEvent>)> {
    let (tx, mut events) = mpsc::channel(64);
    let sink = Arc::new(DownloadDirSink::new(&config.download_dir));
    let handle = Client::connect(config, sink, tx)
        .await
        .context("Could not reach the relay")?;

    loop {
        match events.recv().await {
            Some(ClientEvent::Connected { code, .. }) => {
                println!("Your code: {}", code);
                return Ok((handle, events));
            }
            Some(ClientEvent::Error(e)) => anyhow::bail!("Relay refused us: {}", e),
            Some(ClientEvent::Disconnected) | None => anyhow::bail!("Relay closed the session"),
            Some(_) => continue,
        }
    }
}

async fn run_send(config: ClientConfig, code: String, path: PathBuf) -> Result<()> {
    let (handle, mut events) = connect(config).await?;
    let client = handle.client.clone();

    client.check_code(&code);
    loop {
        match events.recv().await {
            Some(ClientEvent::CodeChecked { valid: false, .. }) => {
                anyhow::bail!("Nobody holds code {}", code)
            }
            Some(ClientEvent::HandshakeComplete { code: paired, .. }) if paired == code => break,
            Some(ClientEvent::Error(e)) => anyhow::bail!(e),
            Some(ClientEvent::Disconnected) | None => anyhow::bail!("Relay closed the session"),
            Some(_) => continue,
        }
    }

    let file_id = client.send_path(&code, &path).await?;
    println!("Uploaded {} as {}", path.display(), file_id);
    client.disconnect().await;
    handle.closed().await;
    Ok(())
}

async fn run_receive(config: ClientConfig, once: bool) -> Result<()> {
    let (handle, mut events) = connect(config).await?;
    let client = handle.client.clone();
    println!("Waiting for files, Ctrl-C to stop");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        match event {
            Some(ClientEvent::HandshakeComplete { code, .. }) => println!("Paired with {}", code),
            Some(ClientEvent::OfferReceived {
                file_id,
                name,
                size,
                archived,
            }) => {
                let kind = if archived { "folder" } else { "file" };
                println!("Receiving {} {} ({})", kind, name, format_size(size));
                client.accept(vec![file_id]);
            }
            Some(ClientEvent::TransferCompleted { path, .. }) => {
                println!("Saved {}", path.display());
                if once {
                    break;
                }
            }
            Some(ClientEvent::CodeInvalidated { code }) => println!("{} left", code),
            Some(ClientEvent::Error(e)) => warn!("{}", e),
            Some(ClientEvent::Disconnected) | None => {
                println!("Relay closed the session");
                return Ok(());
            }
            Some(_) => {}
        }
    }

    client.disconnect().await;
    handle.closed().await;
    Ok(())
}
