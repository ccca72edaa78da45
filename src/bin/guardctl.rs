use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use panel_guard::audit::{AuditEventType, AuditLedger, AuditQuery, ExportFormat, Severity};
use panel_guard::config::{load_config, secrets, GuardConfig};
use panel_guard::totp::{generate_code, TotpAuthenticator};
use panel_guard::vault::{CryptoVault, EncryptedPayload, KeyMaterial};

#[derive(Parser)]
#[command(name = "guardctl")]
#[command(about = "Operator tooling for panel-guard", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when absent.
    #[arg(short, long, env = "PANEL_GUARD_CONFIG", default_value = "panel-guard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a password into salt$hash form
    HashPassword { password: String },
    /// Check a password against a stored salt$hash
    VerifyPassword { password: String, stored: String },
    /// Print a random hex token
    Token {
        #[arg(long, default_value_t = 32)]
        bytes: usize,
    },
    /// Encrypt text with a password, printing iv:tag:ciphertext:salt
    Encrypt {
        #[arg(long)]
        password: String,
        plaintext: String,
    },
    /// Decrypt a compact payload produced by `encrypt`
    Decrypt {
        #[arg(long)]
        password: String,
        payload: String,
    },
    /// TOTP helpers
    #[command(subcommand)]
    Totp(TotpCommand),
    /// Audit ledger maintenance
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand)]
enum TotpCommand {
    /// Generate a secret, provisioning URI and backup codes
    New {
        account: String,
        #[arg(long)]
        issuer: Option<String>,
    },
    /// Print the current code for a base32 secret
    Code { secret: String },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Recompute every signature and report tampering
    Verify,
    /// Print matching events as JSON lines, newest first
    Query(QueryArgs),
    /// Export matching events
    Export {
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        #[command(flatten)]
        filter: QueryArgs,
    },
    /// Delete log files older than the retention period
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Rotate the active file if it exceeds the size limit
    Rotate,
}

#[derive(Args)]
struct QueryArgs {
    /// RFC 3339 lower bound
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// RFC 3339 upper bound
    #[arg(long)]
    end: Option<DateTime<Utc>>,
    #[arg(long)]
    event_type: Option<AuditEventType>,
    #[arg(long)]
    actor_id: Option<String>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

impl From<QueryArgs> for AuditQuery {
    fn from(args: QueryArgs) -> Self {
        AuditQuery {
            start: args.start,
            end: args.end,
            event_type: args.event_type,
            actor_id: args.actor_id,
            ip_address: args.ip,
            severity: args.severity,
            offset: args.offset,
            limit: args.limit,
        }
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        GuardConfig::default()
    };
    let vault = Arc::new(CryptoVault::from_settings(&config.vault, None));

    match cli.command {
        Commands::HashPassword { password } => {
            println!("{}", vault.hash_password(&password));
        }
        Commands::VerifyPassword { password, stored } => {
            if vault.verify_password(&password, &stored)? {
                println!("match");
            } else {
                println!("mismatch");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Token { bytes } => {
            println!("{}", vault.generate_secure_token(bytes));
        }
        Commands::Encrypt { password, plaintext } => {
            let payload = vault.encrypt(plaintext.as_bytes(), KeyMaterial::Password(&password))?;
            println!("{}", payload.to_compact());
        }
        Commands::Decrypt { password, payload } => {
            let payload = EncryptedPayload::from_compact(&payload)?;
            let plain = vault.decrypt(&payload, KeyMaterial::Password(&password))?;
            println!("{}", String::from_utf8_lossy(&plain));
        }
        Commands::Totp(TotpCommand::New { account, issuer }) => {
            let authenticator = TotpAuthenticator::new(config.totp.clone());
            let issuer = issuer.unwrap_or_else(|| authenticator.issuer().to_string());
            let secret = authenticator.generate_secret(&account, &issuer)?;
            println!("secret: {}", secret.secret);
            println!("uri:    {}", secret.provisioning_uri);
            println!("backup codes:");
            for code in &secret.backup_codes {
                println!("  {}", code.code);
            }
        }
        Commands::Totp(TotpCommand::Code { secret }) => {
            let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
            println!("{}", generate_code(&secret, now)?);
        }
        Commands::Audit(command) => return run_audit(command, &config, vault),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_audit(
    command: AuditCommand,
    config: &GuardConfig,
    vault: Arc<CryptoVault>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let key = secrets::audit_signing_key(config)?;
    let ledger = AuditLedger::new(&config.audit, key, vault);

    match command {
        AuditCommand::Verify => {
            let report = ledger.verify_integrity();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                return Ok(ExitCode::FAILURE);
            }
        }
        AuditCommand::Query(args) => {
            for event in ledger.query(&args.into())? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        AuditCommand::Export { format, filter } => {
            println!("{}", ledger.export(&filter.into(), format)?);
        }
        AuditCommand::Cleanup { days } => {
            let removed = ledger.cleanup(days.unwrap_or(config.audit.retention_days))?;
            println!("removed {removed} file(s)");
        }
        AuditCommand::Rotate => match ledger.rotate_if_needed()? {
            Some(backup) => println!("rotated to {}", backup.display()),
            None => println!("no rotation needed"),
        },
    }
    Ok(ExitCode::SUCCESS)
}
