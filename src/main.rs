//! CLI entry point for mixnet contacts.
//!
//! Manages a local contact book: creating contacts and printing the envelope
//! to hand to the peer, completing exchanges with the peer's envelope, running
//! PANDA exchanges through a shared rendezvous directory, and configuration.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{info, warn};
use mixnet_contacts::{
    contact::ContactBook,
    panda::{self, PandaExchange, PandaOutcome},
    transport::{DirectoryRendezvous, MemorySpool, Rendezvous},
    utils::{ContactsConfig, DEFAULT_CONFIG_FILE},
    Contact,
};
use rand::rngs::OsRng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

/// Mixnet Contacts - key exchange and PANDA for mix network messaging
#[derive(Parser)]
#[command(name = "contacts")]
#[command(about = "Manage mix network contacts and their ratchet key exchanges")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory holding the contact book
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a pending contact and print the envelope for the peer
    New {
        /// Nickname for the contact
        nickname: String,
        /// Provider hosting our spool
        #[arg(short, long, default_value = "provider.local")]
        provider: String,
    },
    /// Complete a contact's key exchange with the peer's envelope
    Complete {
        /// Nickname of the pending contact
        nickname: String,
        /// The peer's envelope, base64 encoded
        envelope: String,
    },
    /// List contacts
    List,
    /// Show one contact
    Show {
        /// Nickname of the contact
        nickname: String,
        /// Display format (json, pretty)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Rename a contact
    Rename {
        /// Current nickname
        old: String,
        /// New nickname
        new: String,
    },
    /// Remove a contact
    Remove {
        /// Nickname of the contact
        nickname: String,
    },
    /// Run a PANDA exchange through a shared rendezvous directory
    Panda {
        /// Nickname of the pending contact
        nickname: String,
        /// Secret shared with the peer; omit to resume a stored exchange
        #[arg(short, long)]
        secret: Option<String>,
        /// Directory both parties can reach
        #[arg(short, long, value_name = "DIR")]
        rendezvous_dir: PathBuf,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ContactsConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    match cli.command {
        Commands::Config { action } => handle_config_commands(action, &config),
        command => {
            config.ensure_directories()?;
            let mut book = ContactBook::load(&config.storage.state_file).await?;
            let changed = handle_contact_command(command, &mut book, &config).await?;
            if changed {
                book.save(&config.storage.state_file).await?;
            }
            Ok(())
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

/// Run a contact command; returns true if the book must be saved
async fn handle_contact_command(
    command: Commands,
    book: &mut ContactBook,
    config: &ContactsConfig,
) -> Result<bool> {
    match command {
        Commands::New { nickname, provider } => {
            let spool = MemorySpool::new(provider);
            let contact = book.add_contact(&nickname, &spool, &mut OsRng)?;
            let contact = contact.read().await;

            println!("✓ Contact '{}' created (id {})", contact.nickname(), contact.id());
            println!("Send this envelope to your peer:");
            println!("{}", general_purpose::STANDARD.encode(contact.outgoing_exchange()));
            Ok(true)
        }
        Commands::Complete { nickname, envelope } => {
            let bytes = general_purpose::STANDARD
                .decode(envelope.trim())
                .map_err(|e| anyhow!("Envelope is not valid base64: {}", e))?;
            let contact = book.require(&nickname)?;
            contact.write().await.complete_exchange(&bytes)?;

            println!("✓ Contact '{}' established", nickname);
            Ok(true)
        }
        Commands::List => {
            if book.is_empty() {
                println!("No contacts");
            }
            for contact in book.list() {
                let contact = contact.read().await;
                let note = contact
                    .panda_result()
                    .map(|r| format!("  (PANDA failed: {r})"))
                    .unwrap_or_default();
                println!("{:>4}  {:<24} {}{}", contact.id(), contact.nickname(), contact.status(), note);
            }
            Ok(false)
        }
        Commands::Show { nickname, format } => {
            let contact = book.require(&nickname)?;
            let contact = contact.read().await;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&contact_json(&contact))?),
                "pretty" => print_contact(&contact),
                _ => return Err(anyhow!("Unsupported format: {}", format)),
            }
            Ok(false)
        }
        Commands::Rename { old, new } => {
            book.rename(&old, &new).await?;
            println!("✓ Renamed '{}' to '{}'", old, new);
            Ok(true)
        }
        Commands::Remove { nickname } => {
            book.remove(&nickname).await?;
            println!("✓ Removed '{}'", nickname);
            Ok(true)
        }
        Commands::Panda {
            nickname,
            secret,
            rendezvous_dir,
        } => {
            let contact = book.require(&nickname)?;
            let rendezvous: Arc<dyn Rendezvous> = Arc::new(DirectoryRendezvous::new(rendezvous_dir));

            let mut handle = match secret {
                Some(secret) => {
                    panda::start_exchange(contact.clone(), secret.as_bytes(), rendezvous, &config.panda)
                        .await?
                }
                None => panda::resume_exchange(contact.clone(), rendezvous, &config.panda).await?,
            };
            println!("PANDA exchange running for '{}' (Ctrl-C to stop)...", nickname);

            let outcome = tokio::select! {
                outcome = &mut handle => outcome?,
                _ = signal::ctrl_c() => {
                    info!("Interrupt received, cancelling PANDA exchange");
                    contact.read().await.cancel_panda();
                    handle.await?
                }
            };

            match outcome {
                PandaOutcome::Established => println!("✓ Contact '{}' established via PANDA", nickname),
                PandaOutcome::Failed(reason) => {
                    warn!("PANDA exchange failed: {}", reason);
                    println!("✗ PANDA exchange failed: {}", reason);
                }
                PandaOutcome::Cancelled => {
                    println!("PANDA exchange stopped; resume it later by omitting --secret");
                }
            }
            Ok(true)
        }
        Commands::Config { .. } => Ok(false),
    }
}

fn contact_json(contact: &Contact) -> serde_json::Value {
    let panda_status = contact
        .panda_exchange()
        .and_then(|blob| PandaExchange::from_bytes(blob).ok())
        .map(|exchange| format!("{:?}", exchange.status()));

    serde_json::json!({
        "id": contact.id(),
        "nickname": contact.nickname(),
        "status": contact.status().to_string(),
        "identity": hex::encode(contact.ratchet().identity_public()),
        "peer_identity": contact.ratchet().peer_identity().map(hex::encode),
        "send_channel": contact.send_channel().map(ToString::to_string),
        "outgoing_exchange": general_purpose::STANDARD.encode(contact.outgoing_exchange()),
        "panda_status": panda_status,
        "panda_result": contact.panda_result(),
        "ratchet": contact.ratchet().stats(),
    })
}

fn print_contact(contact: &Contact) {
    println!("Contact {}", contact.nickname());
    println!("==========");
    println!("ID: {}", contact.id());
    println!("Status: {}", contact.status());
    println!("Identity: {}", hex::encode(contact.ratchet().identity_public()));
    if let Some(peer) = contact.ratchet().peer_identity() {
        println!("Peer identity: {}", hex::encode(peer));
    }
    if let Some(channel) = contact.send_channel() {
        println!("Send channel: {}", channel);
    }
    if let Some(result) = contact.panda_result() {
        println!("PANDA result: {}", result);
    }
    if contact.is_pending() {
        println!("Envelope: {}", general_purpose::STANDARD.encode(contact.outgoing_exchange()));
    } else {
        let stats = contact.ratchet().stats();
        println!("Messages sent: {}", stats.messages_sent);
        println!("Messages received: {}", stats.messages_received);
    }
}

fn handle_config_commands(action: ConfigCommands, config: &ContactsConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = ContactsConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                ContactsConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
