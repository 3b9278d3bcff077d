//! Binary entrypoint for the NfcKey CLI.
//!
//! Commands:
//! - `ports` - list serial ports a reader could be on
//! - `status` - connect and report the password-protection state
//! - `set-password` - set the device admin password
//! - `generate [--dual] [--backup <path>]` - write a fresh identity key
//! - `recover` - read the identity key back and print it
//! - `export --out <path>` - recover the key into an encrypted backup file
//! - `import --file <path> [--dual]` - restore a backup onto card(s)/EEPROM

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use nfckey_core::protocol::list_ports;
use nfckey_core::session::KeySession;

#[derive(Parser)]
#[command(name = "nfckey")]
#[command(about = "Manage identity keys on NFC reader devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Serial port of the reader (probed automatically when omitted)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports a reader could be on
    Ports,
    /// Report whether the connected reader is password protected
    Status,
    /// Set the device admin password
    SetPassword,
    /// Generate a fresh identity key and write it to card(s)/EEPROM
    Generate {
        /// Split the key across two cards instead of card plus EEPROM
        #[arg(long)]
        dual: bool,
        /// Also write an encrypted backup to this file
        #[arg(long)]
        backup: Option<PathBuf>,
    },
    /// Recover the identity key from the presented card(s) and print it
    Recover,
    /// Recover the identity key into an encrypted backup file
    Export {
        /// Backup file to write
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Restore an encrypted backup onto card(s)/EEPROM
    Import {
        /// Backup file to read
        #[arg(short, long)]
        file: PathBuf,
        /// Split the key across two cards instead of card plus EEPROM
        #[arg(long)]
        dual: bool,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn connect(port: &Option<String>) -> Result<KeySession> {
    let session = match port {
        Some(name) => KeySession::open(name)
            .with_context(|| format!("failed to open reader on {name}"))?,
        None => KeySession::connect().context("no reader found; try --port")?,
    };
    Ok(session)
}

/// Unlock the session when the device is password protected
fn unlock_if_needed(session: &mut KeySession) -> Result<()> {
    if !session.is_password_protected()? {
        debug!("device is not password protected");
        return Ok(());
    }
    let password = rpassword::prompt_password("Admin password: ")?;
    if !session.unlock(&password)? {
        bail!("wrong admin password");
    }
    Ok(())
}

/// Blocks until the operator confirms the card swap
fn confirm_swap() {
    print!("Remove the card, place the second card, then press Enter... ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}

fn prompt_new_password(what: &str) -> Result<String> {
    let first = rpassword::prompt_password(format!("New {what}: "))?;
    let second = rpassword::prompt_password(format!("Repeat {what}: "))?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(first)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Ports => {
            let ports = list_ports();
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                println!("{}", port.name);
            }
        }
        Commands::Status => {
            let mut session = connect(&cli.port)?;
            let protected = session.is_password_protected()?;
            println!(
                "reader is {}",
                if protected {
                    "password protected"
                } else {
                    "not password protected"
                }
            );
        }
        Commands::SetPassword => {
            let mut session = connect(&cli.port)?;
            unlock_if_needed(&mut session)?;
            let password = prompt_new_password("admin password")?;
            session.set_admin_password(&password)?;
            println!("admin password set");
        }
        Commands::Generate { dual, backup } => {
            let mut session = connect(&cli.port)?;
            unlock_if_needed(&mut session)?;
            let (segment_a, segment_b) = session.write_new_key(dual, &mut confirm_swap)?;
            println!("identity key written");
            if let Some(path) = backup {
                let password = prompt_new_password("backup password")?;
                nfckey_core::backup::export_to_file(&path, &segment_a, &segment_b, &password)?;
                println!("backup written to {}", path.display());
            }
        }
        Commands::Recover => {
            let mut session = connect(&cli.port)?;
            unlock_if_needed(&mut session)?;
            let (segment_a, segment_b, dual) = session.recover_key(&mut confirm_swap)?;
            println!(
                "segment A: {}",
                String::from_utf8_lossy(segment_a.as_bytes())
            );
            println!(
                "segment B: {}",
                String::from_utf8_lossy(segment_b.as_bytes())
            );
            println!("storage: {}", if dual { "dual cards" } else { "card + EEPROM" });
        }
        Commands::Export { out } => {
            let mut session = connect(&cli.port)?;
            unlock_if_needed(&mut session)?;
            let password = prompt_new_password("backup password")?;
            session.export_backup(&out, &password, &mut confirm_swap)?;
            println!("backup written to {}", out.display());
        }
        Commands::Import { file, dual } => {
            let mut session = connect(&cli.port)?;
            unlock_if_needed(&mut session)?;
            let password = rpassword::prompt_password("Backup password: ")?;
            session.import_backup(&file, &password, dual, &mut confirm_swap)?;
            println!("identity key restored from {}", file.display());
        }
    }
    Ok(())
}
