//! CLI command implementations

use anyhow::{Context, Result};
use ethabi::ethereum_types::U256;
use futures::future::join_all;
use k256::ecdsa::SigningKey;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::api::{AuthenticatedPlayer, DelegationService, WalletApprovalBody};
use crate::chain::dispatcher::ChainDispatcher;
use crate::chain::rpc::{EvmRpcClient, HttpTransport};
use crate::chain::types::{checksum_address, parse_address, Chain};
use crate::config::{mask_url, Config};
use crate::delegation::executor::DelegationExecutor;
use crate::delegation::nonce::{FileNonceLedger, InMemoryNonceLedger, NonceLedger};
use crate::delegation::types::{parse_signature, DelegationMessage, NonceValue, SystemId};
use crate::delegation::verifier::{recover_signer, sign_delegation, signer_address};
use crate::wallet::funding::{AesGcmKeyDecryptor, FundingSigner};
use crate::wallet::linkage::WalletLinkageManager;
use crate::wallet::registry::JsonRegistry;

/// Arguments identifying one signed approval
#[derive(Debug, Clone)]
pub struct ApprovalArgs {
    pub address: String,
    pub nonce: String,
    pub signature: String,
    pub chain: String,
}

impl ApprovalArgs {
    fn body(&self) -> Result<WalletApprovalBody> {
        Ok(WalletApprovalBody {
            address: Some(self.address.clone()),
            nonce: Some(NonceValue::parse(&self.nonce)?),
            signature: Some(self.signature.clone()),
            chain: Some(self.chain.clone()),
        })
    }
}

async fn open_ledger(config: &Config) -> Result<Arc<dyn NonceLedger>> {
    match &config.ledger.path {
        Some(path) => Ok(Arc::new(
            FileNonceLedger::open(path)
                .await
                .with_context(|| format!("Failed to open nonce ledger {}", path))?,
        )),
        None => {
            warn!("ledger.path not set - nonces are kept in memory and lost on exit");
            Ok(Arc::new(InMemoryNonceLedger::new()))
        }
    }
}

/// Wire the full connect/disconnect path from configuration
async fn build_service(config: &Config) -> Result<DelegationService> {
    let registry_path = config
        .registry
        .path
        .as_ref()
        .context("registry.path must be configured")?;
    let registry = Arc::new(JsonRegistry::load(registry_path).await?);

    let decryptor = AesGcmKeyDecryptor::from_env(&config.funding.encryption_key_env)?;
    let dispatcher = ChainDispatcher::from_config(config)?;
    let executor = DelegationExecutor::new(
        config,
        open_ledger(config).await?,
        Arc::new(dispatcher),
        Arc::new(decryptor),
    )?;
    info!(chains = ?executor.supported_chains(), "Delegation executor ready");

    let manager = WalletLinkageManager::new(
        config.linkage.clone(),
        registry.clone(),
        registry,
        Arc::new(executor),
    );
    Ok(DelegationService::new(Arc::new(manager)))
}

fn parse_nonce(nonce: &str) -> Result<U256> {
    Ok(NonceValue::parse(nonce)?.value())
}

/// Print the system id for a game
pub fn system_id(game_id: &str) -> Result<()> {
    println!("{}", SystemId::from_game_id(game_id));
    Ok(())
}

/// Sign a delegation message with a connected wallet key
pub fn sign(game_id: &str, delegate: &str, revoke: bool, nonce: &str, key_hex: &str) -> Result<()> {
    let key_bytes = hex::decode(key_hex.trim().trim_start_matches("0x"))
        .context("Signing key is not hex")?;
    let key = SigningKey::from_slice(&key_bytes).context("Invalid secp256k1 key")?;

    let message = DelegationMessage {
        system_id: SystemId::from_game_id(game_id),
        delegate: parse_address(delegate)?,
        approved: !revoke,
        signer: signer_address(&key),
        nonce: parse_nonce(nonce)?,
    };
    let signature = sign_delegation(&key, &message)?;

    let output = serde_json::json!({
        "address": checksum_address(&message.signer),
        "nonce": message.nonce.to_string(),
        "approved": message.approved,
        "systemId": message.system_id.to_hex(),
        "signature": format!("0x{}", hex::encode(signature)),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Recover and check the signer of a delegation signature
pub fn verify(
    game_id: &str,
    delegate: &str,
    revoke: bool,
    signer: &str,
    nonce: &str,
    signature: &str,
) -> Result<()> {
    let message = DelegationMessage {
        system_id: SystemId::from_game_id(game_id),
        delegate: parse_address(delegate)?,
        approved: !revoke,
        signer: parse_address(signer)?,
        nonce: parse_nonce(nonce)?,
    };

    match recover_signer(&message, &parse_signature(signature)?) {
        Ok(recovered) if recovered == message.signer => {
            println!("VALID: signed by {}", checksum_address(&recovered));
            Ok(())
        }
        Ok(recovered) => anyhow::bail!(
            "INVALID: signed by {}, expected {}",
            checksum_address(&recovered),
            checksum_address(&message.signer)
        ),
        Err(e) => anyhow::bail!("INVALID: {}", e),
    }
}

/// Connect an external wallet to a player
pub async fn connect(config: &Config, player_id: &str, args: &ApprovalArgs) -> Result<()> {
    let service = build_service(config).await?;
    let auth = AuthenticatedPlayer {
        player_id: player_id.to_string(),
    };

    let response = service.connect(&auth, player_id, &args.body()?).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Disconnect a player's external wallet
pub async fn disconnect(
    config: &Config,
    player_id: &str,
    wallet_id: &str,
    args: &ApprovalArgs,
) -> Result<()> {
    let service = build_service(config).await?;
    let auth = AuthenticatedPlayer {
        player_id: player_id.to_string(),
    };

    service
        .disconnect(&auth, player_id, wallet_id, &args.body()?)
        .await?;
    println!("Wallet {} disconnected from player {}", wallet_id, player_id);
    Ok(())
}

/// Encrypt a funding wallet private key for the registry
pub fn seal_key(config: &Config, private_key_hex: &str) -> Result<()> {
    let signer = FundingSigner::from_secret_bytes(private_key_hex.trim().as_bytes())?;
    let sealer = AesGcmKeyDecryptor::from_env(&config.funding.encryption_key_env)?;
    let ciphertext = sealer.seal(private_key_hex.trim().as_bytes())?;

    let output = serde_json::json!({
        "address": checksum_address(&signer.address()),
        "ciphertext": ciphertext,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// List consumed nonces for a signer within a game
pub async fn nonces(config: &Config, game_id: &str, signer: &str) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let signer = parse_address(signer)?;
    let consumed = ledger
        .consumed(&SystemId::from_game_id(game_id), &signer)
        .await?;

    println!("\n=== CONSUMED NONCES ===\n");
    println!("Signer: {}", checksum_address(&signer));
    println!("Game:   {}", game_id);
    if consumed.is_empty() {
        println!("(none)");
    }
    for nonce in consumed {
        println!("  {}", nonce);
    }
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check every configured RPC endpoint
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let transport = HttpTransport::new(config.dispatcher.request_timeout_ms)?;
    let mut all_healthy = true;

    let mut chains: Vec<(&Chain, _)> = config.chains.iter().collect();
    chains.sort_by_key(|(chain, _)| **chain);
    if chains.is_empty() {
        println!("No chains configured");
    }

    for (chain, chain_config) in chains {
        println!("{} (chain id {})", chain, chain.chain_id());
        let results = join_all(
            chain_config
                .rpcs
                .iter()
                .map(|rpc| check_rpc(&transport, rpc)),
        )
        .await;
        for (rpc, result) in chain_config.rpcs.iter().zip(results) {
            print!("  {} ... ", mask_url(rpc));
            match result {
                Ok((chain_id, latency)) if chain_id == chain.chain_id() => {
                    println!("OK ({}ms)", latency)
                }
                Ok((chain_id, _)) => {
                    println!("WRONG CHAIN: reports chain id {}", chain_id);
                    all_healthy = false;
                }
                Err(e) => {
                    println!("FAILED: {}", e);
                    all_healthy = false;
                }
            }
        }
    }

    print!("\nFunding key-encryption key ({})... ", config.funding.encryption_key_env);
    match AesGcmKeyDecryptor::from_env(&config.funding.encryption_key_env) {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("MISSING: {}", e);
            all_healthy = false;
        }
    }

    println!();
    if all_healthy {
        println!("All systems healthy");
        Ok(())
    } else {
        anyhow::bail!("One or more health checks failed")
    }
}

async fn check_rpc(transport: &HttpTransport, endpoint: &str) -> Result<(u64, u64)> {
    let client = EvmRpcClient::new(transport, endpoint);
    let start = Instant::now();
    let chain_id = client.chain_id().await?;
    let latency = start.elapsed().as_millis() as u64;
    Ok((chain_id, latency))
}
