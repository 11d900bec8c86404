use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ledgerlock_core::audit::JsonlAuditLog;
use ledgerlock_core::paths;
use ledgerlock_core::rate_limit::MAX_FAILED_ATTEMPTS;
use ledgerlock_core::{SetupOptions, Vault, VaultError, VaultSettings};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const PASSWORD_ENV: &str = "LEDGERLOCK_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about = "Ledgerlock vault administration", long_about = None)]
struct Cli {
    /// Data directory (defaults to the per-user data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Settings file (defaults to <data-dir>/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new vault and print its recovery key
    Init {
        #[arg(long)]
        tax_year: Option<i32>,
        #[arg(long)]
        lock_timeout: Option<u32>,
    },
    /// Verify the password can unlock the vault
    Unlock,
    /// Unlock with the password and a saved recovery key
    Recover {
        #[arg(long)]
        recovery_key: Option<String>,
    },
    /// Re-wrap the data key under a new password
    ChangePassword,
    /// Set the idle lock timeout in minutes
    SetTimeout { minutes: u32 },
    /// Print vault state as JSON
    Status,
    /// Print recent audit events, newest first
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    match cli.command {
        Commands::Init {
            tax_year,
            lock_timeout,
        } => init_command(&settings, tax_year, lock_timeout).await,
        Commands::Unlock => unlock_command(&settings).await,
        Commands::Recover { recovery_key } => recover_command(&settings, recovery_key).await,
        Commands::ChangePassword => change_password_command(&settings).await,
        Commands::SetTimeout { minutes } => set_timeout_command(&settings, minutes).await,
        Commands::Status => status_command(&settings),
        Commands::Events { limit } => events_command(&settings, limit),
    }
}

fn load_settings(cli: &Cli) -> Result<VaultSettings> {
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => paths::data_dir()?,
    };
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| paths::settings_path(&data_dir));
    let mut settings = VaultSettings::load(&settings_path)?;
    if cli.data_dir.is_some() {
        settings.data_dir = Some(data_dir);
    }
    Ok(settings)
}

async fn init_command(
    settings: &VaultSettings,
    tax_year: Option<i32>,
    lock_timeout: Option<u32>,
) -> Result<()> {
    let vault = Vault::open(settings)?;
    let password = prompt_password_twice("Create vault password: ")?;
    let outcome = vault
        .setup(
            &password,
            SetupOptions {
                default_tax_year: tax_year,
                lock_timeout_minutes: lock_timeout,
            },
        )
        .await?;
    println!("Vault created at {}", vault.config_path().display());
    match outcome.recovery_key {
        Some(recovery_key) => {
            println!("Device key stored in the OS keyring.");
            println!();
            println!("RECOVERY KEY (shown once, write it down):");
            println!("  {}", recovery_key.as_str());
            println!();
            println!("You need it together with your password if this machine's keyring is lost.");
        }
        None => println!("No OS keyring available; vault is protected by the password alone."),
    }
    vault.lock();
    Ok(())
}

async fn unlock_command(settings: &VaultSettings) -> Result<()> {
    let vault = Vault::open(settings)?;
    let password = prompt_password_once("Vault password: ")?;
    match vault.unlock(&password).await {
        Ok(token) => {
            info!(session = %token.fingerprint(), "unlock verified");
            println!("Vault unlocked.");
            vault.lock();
            Ok(())
        }
        Err(VaultError::DeviceKeyMissing) => Err(anyhow!(
            "device key missing from this machine; run `ledgerlock recover` with your recovery key"
        )),
        Err(e) => Err(credential_error(&vault, e)),
    }
}

async fn recover_command(settings: &VaultSettings, recovery_key: Option<String>) -> Result<()> {
    let vault = Vault::open(settings)?;
    let password = prompt_password_once("Vault password: ")?;
    let recovery_key = match recovery_key {
        Some(key) => Zeroizing::new(key),
        None => Zeroizing::new(
            rpassword::prompt_password("Recovery key: ")
                .map_err(|e| anyhow!("recovery key prompt: {e}"))?,
        ),
    };
    vault
        .unlock_with_recovery_key(&password, &recovery_key)
        .await
        .map_err(|e| credential_error(&vault, e))?;
    println!("Vault unlocked with recovery key.");
    vault.lock();
    Ok(())
}

async fn change_password_command(settings: &VaultSettings) -> Result<()> {
    let vault = Vault::open(settings)?;
    let current = prompt_password_once("Current password: ")?;
    let token = vault
        .unlock(&current)
        .await
        .map_err(|e| credential_error(&vault, e))?;
    let new_password = Zeroizing::new(
        rpassword::prompt_password("New password: ").map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    let confirm = Zeroizing::new(
        rpassword::prompt_password("Confirm new password: ")
            .map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if *new_password != *confirm {
        vault.lock();
        return Err(anyhow!("passwords do not match"));
    }
    let result = vault.change_password(&token, &current, &new_password).await;
    vault.lock();
    result?;
    println!("Password changed.");
    Ok(())
}

async fn set_timeout_command(settings: &VaultSettings, minutes: u32) -> Result<()> {
    let vault = Vault::open(settings)?;
    let password = prompt_password_once("Vault password: ")?;
    let token = vault
        .unlock(&password)
        .await
        .map_err(|e| credential_error(&vault, e))?;
    let result = vault.set_lock_timeout(&token, minutes).await;
    vault.lock();
    result?;
    println!("Lock timeout set to {minutes} minutes.");
    Ok(())
}

fn status_command(settings: &VaultSettings) -> Result<()> {
    let vault = Vault::open(settings)?;
    let status = vault.status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn events_command(settings: &VaultSettings, limit: usize) -> Result<()> {
    let data_dir = settings.resolve_data_dir()?;
    let log = JsonlAuditLog::open(paths::audit_log_path(&data_dir), settings.audit_log_max_bytes)?;
    for entry in log.read_recent(Some(limit))? {
        println!(
            "{} #{:<5} {:<24} {}",
            entry.timestamp.to_rfc3339(),
            entry.seq,
            entry.event_type,
            entry.data
        );
    }
    Ok(())
}

/// Tell the user how close they are to a lockout before bubbling `err` up.
fn credential_error(vault: &Vault, err: VaultError) -> anyhow::Error {
    if err.is_credential_failure() {
        if let Ok(status) = vault.status() {
            match status.locked_out_secs {
                Some(secs) => eprintln!("Unlocking is paused for another {secs} seconds."),
                None if status.failed_attempts > 0 => eprintln!(
                    "{} of {} attempts used before unlocking is paused.",
                    status.failed_attempts, MAX_FAILED_ATTEMPTS
                ),
                None => {}
            }
        }
    }
    err.into()
}

fn prompt_password_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_password_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_password_once(prompt)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ")
            .map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if *first != *second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
