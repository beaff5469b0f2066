//! Wallet linkage manager
//!
//! Connect submits the approval first and links the wallet once the chain
//! accepted it. Disconnect runs as a compensated unit of work: the player is
//! unlinked off-chain, the revocation is submitted, and a failed submission
//! re-links the previous wallet. The off-chain store and the chain are not
//! jointly transactional, so consistency is best effort: a rollback that
//! keeps failing is logged at error level.

use backoff::{future::retry, ExponentialBackoff};
use ethabi::Address;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::registry::{GameDirectory, LinkageStore};
use super::types::{DisconnectState, GameRecord, PlayerRecord, WalletRecord};
use crate::chain::transaction::TransactionRecord;
use crate::chain::types::{parse_address, same_address};
use crate::config::LinkageConfig;
use crate::delegation::executor::{ApprovalContext, DelegationExecutor};
use crate::delegation::types::{ApprovalInput, SystemId};
use crate::error::{Error, Result};

/// Result of a successful connect
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub wallet: WalletRecord,
    pub transaction: TransactionRecord,
}

/// Result of a committed disconnect
#[derive(Debug, Clone)]
pub struct DisconnectOutcome {
    pub wallet_id: String,
    pub transaction: TransactionRecord,
    pub state: DisconnectState,
}

/// Tracks one disconnect through its states
struct DisconnectSaga<'a> {
    player_id: &'a str,
    state: DisconnectState,
}

impl<'a> DisconnectSaga<'a> {
    fn new(player_id: &'a str) -> Self {
        Self {
            player_id,
            state: DisconnectState::Pending,
        }
    }

    fn advance(&mut self, next: DisconnectState) {
        debug!(
            player_id = self.player_id,
            from = %self.state,
            to = %next,
            "Disconnect state change"
        );
        self.state = next;
    }
}

pub struct WalletLinkageManager {
    directory: Arc<dyn GameDirectory>,
    store: Arc<dyn LinkageStore>,
    executor: Arc<DelegationExecutor>,
    settings: LinkageConfig,
}

impl WalletLinkageManager {
    pub fn new(
        settings: LinkageConfig,
        directory: Arc<dyn GameDirectory>,
        store: Arc<dyn LinkageStore>,
        executor: Arc<DelegationExecutor>,
    ) -> Self {
        Self {
            directory,
            store,
            executor,
            settings,
        }
    }

    pub fn executor(&self) -> &Arc<DelegationExecutor> {
        &self.executor
    }

    /// Upsert a wallet record for `address` and make it the player's
    /// connected wallet
    pub async fn link_wallet(&self, player_id: &str, address: &Address) -> Result<WalletRecord> {
        let wallet = self
            .store
            .connect_wallet(player_id, address, self.settings.wallet_scope)
            .await?;
        info!(player_id, wallet_id = %wallet.id, address = %wallet.address, "Wallet linked");
        Ok(wallet)
    }

    async fn player_and_game(&self, player_id: &str) -> Result<(PlayerRecord, GameRecord)> {
        let player = self.directory.player(player_id).await?;
        let game = self.directory.game(&player.game_id).await?;
        Ok((player, game))
    }

    fn custodial_address(player: &PlayerRecord) -> Result<Address> {
        parse_address(&player.custodial_wallet.address).map_err(|e| {
            Error::Persistence(format!("player {} custodial wallet: {}", player.id, e))
        })
    }

    /// Approve the player's custodial wallet as delegate on-chain, then link
    /// the signer's wallet
    pub async fn connect(&self, player_id: &str, input: &ApprovalInput) -> Result<ConnectOutcome> {
        let (player, game) = self.player_and_game(player_id).await?;
        let delegate = Self::custodial_address(&player)?;

        let transaction = self
            .executor
            .execute(
                ApprovalContext {
                    system_id: SystemId::from_game_id(&game.id),
                    delegate,
                    approved: true,
                    funding_ciphertext: &game.funding_wallet.ciphertext,
                    game_rpcs: &game.rpcs,
                },
                input,
            )
            .await?;

        let address = parse_address(input.signer.as_deref().unwrap_or_default())?;
        let wallet = self.link_wallet(player_id, &address).await.map_err(|e| {
            error!(
                player_id,
                tx_hash = %transaction.hash,
                "Approval is on-chain but linking failed: {}",
                e
            );
            e
        })?;

        Ok(ConnectOutcome {
            wallet,
            transaction,
        })
    }

    /// Unlink the player's connected wallet and revoke the delegate on-chain
    /// as one compensated unit of work
    ///
    /// `wallet_id`, when given, must name the currently connected wallet.
    pub async fn disconnect(
        &self,
        player_id: &str,
        wallet_id: Option<&str>,
        input: &ApprovalInput,
    ) -> Result<DisconnectOutcome> {
        let (player, game) = self.player_and_game(player_id).await?;
        let current = player
            .connected_wallet_id
            .clone()
            .ok_or(Error::NoConnectedWallet)?;

        // Everything that can be rejected is rejected before any mutation
        self.executor.resolve_chain(input)?;
        if let Some(requested) = wallet_id {
            if requested != current {
                return Err(Error::InvalidRequest(format!(
                    "wallet {} is not the player's connected wallet",
                    requested
                )));
            }
        }
        let wallet = self.store.wallet(&current).await?.ok_or_else(|| {
            Error::Persistence(format!("connected wallet {} has no record", current))
        })?;
        let signer = parse_address(input.signer.as_deref().unwrap_or_default())?;
        if !same_address(&wallet.address, &signer) {
            return Err(Error::InvalidRequest(
                "address does not match the player's connected wallet".to_string(),
            ));
        }
        let delegate = Self::custodial_address(&player)?;

        let mut saga = DisconnectSaga::new(player_id);

        if !self
            .store
            .compare_and_set_link(player_id, Some(&current), None)
            .await?
        {
            return Err(Error::InvalidRequest(
                "connected wallet changed during disconnect".to_string(),
            ));
        }
        saga.advance(DisconnectState::OffchainApplied {
            previous_wallet_id: current.clone(),
        });

        let submitted = self
            .executor
            .execute(
                ApprovalContext {
                    system_id: SystemId::from_game_id(&game.id),
                    delegate,
                    approved: false,
                    funding_ciphertext: &game.funding_wallet.ciphertext,
                    game_rpcs: &game.rpcs,
                },
                input,
            )
            .await;

        saga.advance(DisconnectState::OnchainSubmitted {
            previous_wallet_id: current.clone(),
            success: submitted.is_ok(),
        });

        match submitted {
            Ok(transaction) => {
                saga.advance(DisconnectState::Committed);
                info!(
                    player_id,
                    wallet_id = %current,
                    tx_hash = %transaction.hash,
                    "Wallet disconnected"
                );
                Ok(DisconnectOutcome {
                    wallet_id: current,
                    transaction,
                    state: saga.state,
                })
            }
            Err(chain_error) => {
                warn!(player_id, wallet_id = %current, "Revocation failed, rolling back: {}", chain_error);
                match self.rollback(player_id, &current).await {
                    Ok(()) => saga.advance(DisconnectState::RolledBack),
                    Err(rollback_error) => error!(
                        player_id,
                        wallet_id = %current,
                        state = %saga.state,
                        "Rollback failed, player left unlinked while delegate stays approved: {}",
                        rollback_error
                    ),
                }
                Err(chain_error)
            }
        }
    }

    /// Re-link `previous`, retrying transient store failures
    async fn rollback(&self, player_id: &str, previous: &str) -> Result<()> {
        let limit = self.settings.rollback_attempts.max(1);
        let used = AtomicU32::new(0);

        retry(self.rollback_backoff(), || async {
            let attempt = used.fetch_add(1, Ordering::SeqCst) + 1;
            match self.restore_link(player_id, previous).await {
                Ok(()) => Ok(()),
                Err(e @ (Error::Persistence(_) | Error::Io(_))) if attempt < limit => {
                    warn!(player_id, attempt, "Rollback attempt failed: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    fn rollback_backoff(&self) -> ExponentialBackoff {
        let base = self.settings.rollback_base_delay_ms;
        ExponentialBackoff {
            initial_interval: Duration::from_millis(base),
            max_interval: Duration::from_millis(base.saturating_mul(8)),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Idempotent reverse of the off-chain unlink
    async fn restore_link(&self, player_id: &str, previous: &str) -> Result<()> {
        if self
            .store
            .compare_and_set_link(player_id, None, Some(previous))
            .await?
        {
            return Ok(());
        }

        let current = self.directory.player(player_id).await?.connected_wallet_id;
        if current.as_deref() != Some(previous) {
            // A newer connect superseded the link; do not overwrite it
            warn!(
                player_id,
                previous,
                current = current.as_deref().unwrap_or("none"),
                "Link changed before rollback, leaving it"
            );
        }
        Ok(())
    }
}
