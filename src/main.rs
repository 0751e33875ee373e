// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use gatekeeper::audit::file_sink::{ChainStatus, JsonlFileSink};
use gatekeeper::config::SecurityConfig;
use gatekeeper::error::{ConfigError, SecurityError};
use gatekeeper::security::{CryptoService, EncryptionKey, RolePermissionTable};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOG_ENV: &str = "GATEKEEPER_LOG";

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - invalid input data format
    pub const DATA_ERR: i32 = 65;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// gatekeeper - operator tooling for the security kernel.
#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(version = VERSION)]
#[command(about = "Operator tooling for the gatekeeper security kernel.")]
#[command(long_about = "gatekeeper - operator tooling for the security kernel\n\n\
    Generate a key:      gatekeeper keygen --save\n\
    Check config:        gatekeeper config check\n\
    Protect a field:     gatekeeper encrypt \"4111-1111-1111-1111\"\n\
    Inspect roles:       gatekeeper roles\n\n\
    Log verbosity is controlled by GATEKEEPER_LOG (e.g. GATEKEEPER_LOG=debug).")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.gatekeeper/config.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a fresh AES-256 key (base64)
    Keygen {
        /// Store the key in the config file instead of printing it
        #[arg(long)]
        save: bool,
    },

    /// Encrypt a field value with the configured key
    Encrypt {
        plaintext: String,
    },

    /// Decrypt a token produced by `encrypt`
    Decrypt {
        token: String,
    },

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },

    /// Print the default role/permission table
    Roles,

    /// Verify the integrity chain of a JSON-lines audit file
    VerifyAudit {
        path: PathBuf,
        /// Integrity key the file was written with
        #[arg(long, env = "GATEKEEPER_AUDIT_KEY", hide_env_values = true)]
        key: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration (key redacted)
    Show,
    /// Validate the effective configuration
    Check,
}

fn config_path(cli_path: Option<&Path>) -> Result<PathBuf> {
    match cli_path {
        Some(path) => Ok(path.to_path_buf()),
        None => SecurityConfig::default_path().context("Could not locate config directory"),
    }
}

fn load_crypto(path: &Path) -> Result<CryptoService> {
    let config = SecurityConfig::load_from(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    let key = config.encryption_key.as_ref().ok_or(ConfigError::MissingKey)?;
    Ok(CryptoService::new(key))
}

fn handle_keygen(path: &Path, save: bool) -> Result<()> {
    let key = EncryptionKey::generate();
    if !save {
        println!("{}", key.to_base64());
        return Ok(());
    }

    let mut config = SecurityConfig::read_from(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    if config.encryption_key.is_some() {
        println!(
            "{} Replacing existing key; data encrypted with it will no longer decrypt.",
            "[!]".yellow()
        );
    }
    config.encryption_key = Some(key);
    config
        .save_to(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} Key saved to {}", "[✓]".green(), path.display().to_string().cyan());
    Ok(())
}

fn handle_config_show(path: &Path) -> Result<()> {
    let config = SecurityConfig::read_from(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let mut value = serde_json::to_value(&config).context("Failed to serialize config")?;
    if let Some(obj) = value.as_object_mut() {
        if matches!(obj.get("encryption_key"), Some(Value::String(_))) {
            obj.insert("encryption_key".to_string(), Value::String("[REDACTED]".to_string()));
        }
    }

    println!("{} {}", "Config file:".bold(), path.display().to_string().cyan());
    println!();
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn handle_config_check(path: &Path) -> Result<()> {
    SecurityConfig::load_from(path)
        .with_context(|| format!("Configuration at {} is invalid", path.display()))?;
    println!("{} Configuration OK", "[✓]".green());
    Ok(())
}

fn handle_roles() {
    let table = RolePermissionTable::default();
    println!("{}", "Roles".bold());
    println!();
    println!(
        "  {:<12} {}",
        table.super_role().cyan(),
        "all permissions (super-role)".dimmed()
    );
    for (role, permissions) in table.roles() {
        let scope = if table.is_ownership_scoped(role) {
            " (own records only)".dimmed().to_string()
        } else {
            String::new()
        };
        let perms: Vec<&str> = permissions.iter().map(String::as_str).collect();
        println!("  {:<12} {}{}", role.cyan(), perms.join(" "), scope);
    }
}

fn handle_verify_audit(path: &Path, key: &str) -> Result<()> {
    let status = JsonlFileSink::verify(path, key.as_bytes())
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match status {
        ChainStatus::Intact { lines } => {
            println!("{} {} events, chain intact", "[✓]".green(), lines);
            Ok(())
        }
        ChainStatus::Broken { line } => {
            anyhow::bail!("integrity chain broken at line {}", line)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = config_path(cli.config.as_deref())?;
    match cli.command {
        Commands::Keygen { save } => handle_keygen(&path, save),
        Commands::Encrypt { plaintext } => {
            let crypto = load_crypto(&path)?;
            println!("{}", crypto.encrypt_str(&plaintext)?);
            Ok(())
        }
        Commands::Decrypt { token } => {
            let crypto = load_crypto(&path)?;
            println!("{}", crypto.decrypt_str(token.trim())?);
            Ok(())
        }
        Commands::Config { command } => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => handle_config_show(&path),
            ConfigCommands::Check => handle_config_check(&path),
        },
        Commands::Roles => {
            handle_roles();
            Ok(())
        }
        Commands::VerifyAudit { path, key } => handle_verify_audit(&path, &key),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        CONFIG
    } else if err.downcast_ref::<SecurityError>().is_some() {
        DATA_ERR
    } else {
        ERROR
    }
}

fn main() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "[✗]".red(), e);
        std::process::exit(exit_code_for(&e));
    }
}
