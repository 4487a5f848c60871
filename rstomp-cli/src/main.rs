//! rstomp-cli - Command-line interface for rstomp
//!
//! Sends and consumes messages, and hashes passcodes for the broker config.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rstomp_client::{AckMode, Client, ConnectionConfig};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstomp-cli")]
#[command(about = "Command-line interface for the rstomp message broker")]
#[command(version)]
struct Cli {
    /// Broker address
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    server: SocketAddr,

    /// Virtual host sent in CONNECT
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Login name
    #[arg(short, long, env = "RSTOMP_LOGIN")]
    login: Option<String>,

    /// Passcode
    #[arg(short, long, env = "RSTOMP_PASSCODE")]
    passcode: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show what the broker reports on CONNECT
    Info,

    /// Send a message to a destination
    Send {
        /// Destination, e.g. /queue/orders
        destination: String,

        /// Message body (or @file to read from file)
        body: String,

        /// Content type of the body
        #[arg(short = 't', long)]
        content_type: Option<String>,

        /// Send the body as JSON (validated before sending)
        #[arg(long, conflicts_with = "content_type")]
        json: bool,

        /// Number of copies to send
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Send all copies in one transaction
        #[arg(long)]
        transaction: bool,
    },

    /// Subscribe to a destination and print messages
    Subscribe {
        /// Destination, e.g. /queue/orders
        destination: String,

        /// Acknowledgement mode
        #[arg(short, long, value_enum, default_value = "auto")]
        ack: AckArg,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Print full frames including headers
        #[arg(long)]
        headers: bool,
    },

    /// Generate SHA-256 hash of a passcode for config files
    HashPassword {
        /// The passcode to hash
        passcode: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum AckArg {
    Auto,
    Client,
    ClientIndividual,
}

impl From<AckArg> for AckMode {
    fn from(arg: AckArg) -> Self {
        match arg {
            AckArg::Auto => AckMode::Auto,
            AckArg::Client => AckMode::Client,
            AckArg::ClientIndividual => AckMode::ClientIndividual,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handle hash-password locally (no broker connection needed)
    if let Commands::HashPassword { passcode } = &cli.command {
        println!("{}", commands::hash_passcode(passcode));
        return Ok(());
    }

    let mut config = ConnectionConfig::new(cli.server).with_host(cli.host);
    match (cli.login, cli.passcode) {
        (Some(login), Some(passcode)) => config = config.with_credentials(login, passcode),
        (None, None) => {}
        _ => {
            eprintln!(
                "{}: --login and --passcode must be used together",
                "Error".red()
            );
            std::process::exit(1);
        }
    }

    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let result = commands::execute(&client, cli.command).await;
    match result {
        Ok(Some(output)) => println!("{}", output),
        Ok(None) => {}
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    client.disconnect().await?;
    Ok(())
}
