//! Player, game and wallet registry
//!
//! `GameDirectory` and `LinkageStore` are the persistence seams the linkage
//! manager works against. `JsonRegistry` implements both over one JSON
//! document; every mutation is applied to a copy, persisted, then swapped in
//! under the write lock so a failed save leaves nothing half-applied.

use async_trait::async_trait;
use chrono::Utc;
use ethabi::Address;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{GameRecord, PlayerRecord, RegistryDocument, WalletRecord};
use crate::chain::types::{format_address, same_address};
use crate::config::WalletScope;
use crate::error::{Error, Result};

/// Read access to players and games
#[async_trait]
pub trait GameDirectory: Send + Sync {
    async fn player(&self, player_id: &str) -> Result<PlayerRecord>;

    async fn game(&self, game_id: &str) -> Result<GameRecord>;
}

/// Player to connected-wallet linkage
#[async_trait]
pub trait LinkageStore: Send + Sync {
    /// Upsert a wallet record for `address` and make it the player's
    /// connected wallet, superseding any previous one
    async fn connect_wallet(
        &self,
        player_id: &str,
        address: &Address,
        scope: WalletScope,
    ) -> Result<WalletRecord>;

    /// Set the player's connected wallet to `new` only if it is currently
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_set_link(
        &self,
        player_id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool>;

    async fn wallet(&self, wallet_id: &str) -> Result<Option<WalletRecord>>;
}

/// JSON-document registry, optionally persisted to disk
pub struct JsonRegistry {
    doc: Arc<RwLock<RegistryDocument>>,
    persistence_path: Option<PathBuf>,
}

impl JsonRegistry {
    pub fn in_memory(doc: RegistryDocument) -> Self {
        Self {
            doc: Arc::new(RwLock::new(doc)),
            persistence_path: None,
        }
    }

    /// Load from `path`, starting empty when the file does not exist yet
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
            let doc: RegistryDocument = serde_json::from_str(&data)
                .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
            info!(
                games = doc.games.len(),
                players = doc.players.len(),
                wallets = doc.wallets.len(),
                "Loaded registry from {}",
                path.display()
            );
            doc
        } else {
            RegistryDocument::default()
        };

        Ok(Self {
            doc: Arc::new(RwLock::new(doc)),
            persistence_path: Some(path),
        })
    }

    /// Copy of the current document
    pub async fn snapshot(&self) -> RegistryDocument {
        self.doc.read().await.clone()
    }

    pub async fn upsert_game(&self, game: GameRecord) -> Result<()> {
        self.mutate(|doc| {
            doc.games.retain(|g| g.id != game.id);
            doc.games.push(game);
            Ok(())
        })
        .await
    }

    pub async fn upsert_player(&self, player: PlayerRecord) -> Result<()> {
        self.mutate(|doc| {
            doc.players.retain(|p| p.id != player.id);
            doc.players.push(player);
            Ok(())
        })
        .await
    }

    /// Apply `f` as one unit of work
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryDocument) -> Result<T>,
    {
        let mut guard = self.doc.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.save(&next).await?;
        *guard = next;
        Ok(out)
    }

    async fn save(&self, doc: &RegistryDocument) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Persistence(e.to_string()))?;
            }
        }

        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;

        debug!("Saved registry to {}", path.display());
        Ok(())
    }
}

fn find_player<'a>(doc: &'a mut RegistryDocument, player_id: &str) -> Result<&'a mut PlayerRecord> {
    doc.players
        .iter_mut()
        .find(|p| p.id == player_id)
        .ok_or_else(|| Error::PlayerNotFound(player_id.to_string()))
}

#[async_trait]
impl GameDirectory for JsonRegistry {
    async fn player(&self, player_id: &str) -> Result<PlayerRecord> {
        self.doc
            .read()
            .await
            .players
            .iter()
            .find(|p| p.id == player_id)
            .cloned()
            .ok_or_else(|| Error::PlayerNotFound(player_id.to_string()))
    }

    async fn game(&self, game_id: &str) -> Result<GameRecord> {
        self.doc
            .read()
            .await
            .games
            .iter()
            .find(|g| g.id == game_id)
            .cloned()
            .ok_or_else(|| Error::GameNotFound(game_id.to_string()))
    }
}

#[async_trait]
impl LinkageStore for JsonRegistry {
    async fn connect_wallet(
        &self,
        player_id: &str,
        address: &Address,
        scope: WalletScope,
    ) -> Result<WalletRecord> {
        let target = *address;
        let address = format_address(address);
        let player_id = player_id.to_string();

        self.mutate(move |doc| {
            find_player(doc, &player_id)?;

            let existing = doc
                .wallets
                .iter()
                .find(|w| {
                    same_address(&w.address, &target)
                        && match scope {
                            WalletScope::Shared => true,
                            WalletScope::Player => {
                                w.player_id.as_deref() == Some(player_id.as_str())
                            }
                        }
                })
                .cloned();

            let wallet = match existing {
                Some(wallet) => wallet,
                None => {
                    let wallet = WalletRecord {
                        id: Uuid::new_v4().to_string(),
                        address: address.clone(),
                        player_id: match scope {
                            WalletScope::Shared => None,
                            WalletScope::Player => Some(player_id.clone()),
                        },
                        created_at: Utc::now(),
                    };
                    doc.wallets.push(wallet.clone());
                    wallet
                }
            };

            find_player(doc, &player_id)?.connected_wallet_id = Some(wallet.id.clone());
            Ok(wallet)
        })
        .await
    }

    async fn compare_and_set_link(
        &self,
        player_id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        {
            let doc = self.doc.read().await;
            let player = doc
                .players
                .iter()
                .find(|p| p.id == player_id)
                .ok_or_else(|| Error::PlayerNotFound(player_id.to_string()))?;
            if player.connected_wallet_id.as_deref() != expected {
                return Ok(false);
            }
        }

        self.mutate(|doc| {
            let player = find_player(doc, player_id)?;
            // Re-check under the write lock
            if player.connected_wallet_id.as_deref() != expected {
                return Ok(false);
            }
            player.connected_wallet_id = new.map(str::to_string);
            Ok(true)
        })
        .await
    }

    async fn wallet(&self, wallet_id: &str) -> Result<Option<WalletRecord>> {
        Ok(self
            .doc
            .read()
            .await
            .wallets
            .iter()
            .find(|w| w.id == wallet_id)
            .cloned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::types::checksum_address;
    use crate::wallet::types::{CustodialWallet, FundingWalletRecord};
    use std::collections::HashMap;

    pub(crate) fn player(id: &str, game_id: &str) -> PlayerRecord {
        PlayerRecord {
            id: id.to_string(),
            game_id: game_id.to_string(),
            custodial_wallet: CustodialWallet {
                address: format!("0x{}", "22".repeat(20)),
            },
            connected_wallet_id: None,
        }
    }

    pub(crate) fn game(id: &str, ciphertext: &str) -> GameRecord {
        GameRecord {
            id: id.to_string(),
            rpcs: HashMap::new(),
            funding_wallet: FundingWalletRecord {
                address: format!("0x{}", "46".repeat(20)),
                ciphertext: ciphertext.to_string(),
            },
        }
    }

    fn registry() -> JsonRegistry {
        let mut doc = RegistryDocument::default();
        doc.games.push(game("game123", "ct"));
        doc.players.push(player("p1", "game123"));
        doc.players.push(player("p2", "game123"));
        JsonRegistry::in_memory(doc)
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let registry = registry();
        assert!(registry.player("p1").await.is_ok());
        assert!(matches!(
            registry.player("nobody").await,
            Err(Error::PlayerNotFound(_))
        ));
        assert!(matches!(
            registry.game("nogame").await,
            Err(Error::GameNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_scope_reuses_wallet_across_players() {
        let registry = registry();
        let address = Address::from_slice(&[0xab; 20]);

        let first = registry
            .connect_wallet("p1", &address, WalletScope::Shared)
            .await
            .unwrap();
        let second = registry
            .connect_wallet("p2", &address, WalletScope::Shared)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(registry.snapshot().await.wallets.len(), 1);
        assert_eq!(
            registry.player("p2").await.unwrap().connected_wallet_id,
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn test_shared_scope_matches_checksummed_record() {
        let address = Address::from_slice(&[0xab; 20]);
        let mut doc = RegistryDocument::default();
        doc.games.push(game("game123", "ct"));
        doc.players.push(player("p1", "game123"));
        doc.wallets.push(WalletRecord {
            id: "w-1".to_string(),
            address: checksum_address(&address),
            player_id: None,
            created_at: Utc::now(),
        });
        let registry = JsonRegistry::in_memory(doc);

        let wallet = registry
            .connect_wallet("p1", &address, WalletScope::Shared)
            .await
            .unwrap();

        assert_eq!(wallet.id, "w-1");
        assert_eq!(registry.snapshot().await.wallets.len(), 1);
    }

    #[tokio::test]
    async fn test_player_scope_creates_separate_records() {
        let registry = registry();
        let address = Address::from_slice(&[0xab; 20]);

        let first = registry
            .connect_wallet("p1", &address, WalletScope::Player)
            .await
            .unwrap();
        let second = registry
            .connect_wallet("p2", &address, WalletScope::Player)
            .await
            .unwrap();
        let again = registry
            .connect_wallet("p1", &address, WalletScope::Player)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.id, again.id);
        assert_eq!(second.player_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_connect_supersedes_previous_wallet() {
        let registry = registry();
        let a = registry
            .connect_wallet("p1", &Address::from_slice(&[1; 20]), WalletScope::Shared)
            .await
            .unwrap();
        let b = registry
            .connect_wallet("p1", &Address::from_slice(&[2; 20]), WalletScope::Shared)
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(
            registry.player("p1").await.unwrap().connected_wallet_id,
            Some(b.id)
        );
    }

    #[tokio::test]
    async fn test_compare_and_set_link() {
        let registry = registry();
        let wallet = registry
            .connect_wallet("p1", &Address::from_slice(&[1; 20]), WalletScope::Shared)
            .await
            .unwrap();

        assert!(!registry
            .compare_and_set_link("p1", None, Some("x"))
            .await
            .unwrap());
        assert!(registry
            .compare_and_set_link("p1", Some(&wallet.id), None)
            .await
            .unwrap());
        assert_eq!(registry.player("p1").await.unwrap().connected_wallet_id, None);
        assert!(registry
            .compare_and_set_link("p1", None, Some(&wallet.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = JsonRegistry::load(&path).await.unwrap();
        registry.upsert_game(game("game123", "ct")).await.unwrap();
        registry.upsert_player(player("p1", "game123")).await.unwrap();
        let wallet = registry
            .connect_wallet("p1", &Address::from_slice(&[7; 20]), WalletScope::Shared)
            .await
            .unwrap();

        let reloaded = JsonRegistry::load(&path).await.unwrap();
        let player = reloaded.player("p1").await.unwrap();
        assert_eq!(player.connected_wallet_id, Some(wallet.id.clone()));
        assert_eq!(
            reloaded.wallet(&wallet.id).await.unwrap().unwrap().address,
            format!("0x{}", "07".repeat(20))
        );
    }

    #[tokio::test]
    async fn test_unknown_player_mutation_changes_nothing() {
        let registry = registry();
        let err = registry
            .connect_wallet("ghost", &Address::from_slice(&[1; 20]), WalletScope::Shared)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlayerNotFound(_)));
        assert!(registry.snapshot().await.wallets.is_empty());
    }
}
