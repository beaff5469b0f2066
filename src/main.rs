//! Delegation Relay - gasless delegate approvals for connected wallets
//!
//! # WARNING
//! - `connect` and `disconnect` submit real transactions paid by the game's funding wallet.
//! - Keep the registry file private: it holds encrypted funding keys.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use delegation_relay::cli::commands::{self, ApprovalArgs};
use delegation_relay::config::Config;

/// Delegation Relay - gasless delegate approvals
#[derive(Parser)]
#[command(name = "delegate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "delegate.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Approval {
    /// External wallet address that signed the approval
    #[arg(long)]
    address: String,

    /// Approval nonce (decimal or 0x hex)
    #[arg(long)]
    nonce: String,

    /// 65-byte signature as hex
    #[arg(long)]
    signature: String,

    /// Chain name, e.g. MATIC
    #[arg(long)]
    chain: String,
}

impl From<Approval> for ApprovalArgs {
    fn from(a: Approval) -> Self {
        Self {
            address: a.address,
            nonce: a.nonce,
            signature: a.signature,
            chain: a.chain,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the system id derived from a game id
    SystemId {
        game_id: String,
    },

    /// Sign a delegation approval with a connected wallet key
    Sign {
        #[arg(long)]
        game: String,

        /// Delegate (custodial wallet) address
        #[arg(long)]
        delegate: String,

        /// Sign a revocation instead of an approval
        #[arg(long)]
        revoke: bool,

        #[arg(long)]
        nonce: String,

        /// Connected wallet private key (hex)
        #[arg(long, env = "DELEGATE_SIGNING_KEY", hide_env_values = true)]
        key: String,
    },

    /// Check that a signature was produced by the claimed signer
    Verify {
        #[arg(long)]
        game: String,

        #[arg(long)]
        delegate: String,

        #[arg(long)]
        revoke: bool,

        #[arg(long)]
        signer: String,

        #[arg(long)]
        nonce: String,

        #[arg(long)]
        signature: String,
    },

    /// Connect an external wallet to a player
    Connect {
        #[arg(long)]
        player: String,

        #[command(flatten)]
        approval: Approval,
    },

    /// Disconnect a player's external wallet
    Disconnect {
        #[arg(long)]
        player: String,

        #[arg(long)]
        wallet_id: String,

        #[command(flatten)]
        approval: Approval,
    },

    /// Encrypt a funding wallet key for the registry
    SealKey {
        /// Funding wallet private key (hex)
        #[arg(long, env = "DELEGATE_FUNDING_KEY", hide_env_values = true)]
        key: String,
    },

    /// List consumed nonces for a signer
    Nonces {
        #[arg(long)]
        game: String,

        #[arg(long)]
        signer: String,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check RPC endpoints and key material
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("delegation_relay=info".parse()?);
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::SystemId { game_id } => commands::system_id(&game_id),
        Commands::Sign {
            game,
            delegate,
            revoke,
            nonce,
            key,
        } => commands::sign(&game, &delegate, revoke, &nonce, &key),
        Commands::Verify {
            game,
            delegate,
            revoke,
            signer,
            nonce,
            signature,
        } => commands::verify(&game, &delegate, revoke, &signer, &nonce, &signature),
        Commands::Connect { player, approval } => {
            startup_checks(&config);
            commands::connect(&config, &player, &approval.into()).await
        }
        Commands::Disconnect {
            player,
            wallet_id,
            approval,
        } => {
            startup_checks(&config);
            commands::disconnect(&config, &player, &wallet_id, &approval.into()).await
        }
        Commands::SealKey { key } => commands::seal_key(&config, &key),
        Commands::Nonces { game, signer } => commands::nonces(&config, &game, &signer).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Warn about settings that are unsafe for submitting transactions
fn startup_checks(config: &Config) {
    info!("Performing startup checks...");

    if config.ledger.path.is_none() {
        warn!("No ledger.path configured - consumed nonces will not survive a restart");
    }

    // Registry holds encrypted funding keys (Unix only)
    #[cfg(unix)]
    if let Some(path) = &config.registry.path {
        use std::os::unix::fs::PermissionsExt;

        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    "Registry file {} has permissions {:o}. Run 'chmod 600 {}' to restrict it.",
                    path,
                    mode & 0o777,
                    path
                );
            }
        }
    }

    info!(chains = config.chains.len(), "Startup checks done");
}
