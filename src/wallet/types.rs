//! Core types for player, game and wallet records
//!
//! Defines the registry document and the disconnect saga states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chain::types::Chain;

/// Player account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub id: String,

    pub game_id: String,

    /// Custodial wallet that acts as delegate for a connected wallet
    pub custodial_wallet: CustodialWallet,

    /// Currently connected external wallet, if any
    #[serde(default)]
    pub connected_wallet_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodialWallet {
    pub address: String,
}

/// Game record as seen by the delegation path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub id: String,

    /// Game-specific RPC endpoints per chain
    #[serde(default)]
    pub rpcs: HashMap<Chain, Vec<String>>,

    /// Wallet paying gas for approval submissions
    pub funding_wallet: FundingWalletRecord,
}

/// Funding wallet, stored encrypted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingWalletRecord {
    pub address: String,

    /// base64(nonce || AES-256-GCM ciphertext) of the private key
    pub ciphertext: String,
}

/// External wallet a player can connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    pub id: String,

    /// `0x` address; written lower-case, read in any casing
    pub address: String,

    /// Owning player when records are player scoped
    #[serde(default)]
    pub player_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Registry file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Registry format version
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub games: Vec<GameRecord>,

    #[serde(default)]
    pub players: Vec<PlayerRecord>,

    #[serde(default)]
    pub wallets: Vec<WalletRecord>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            games: Vec::new(),
            players: Vec::new(),
            wallets: Vec::new(),
        }
    }
}

/// Disconnect unit of work
///
/// `Pending → OffchainApplied → OnchainSubmitted → Committed | RolledBack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DisconnectState {
    /// Nothing mutated yet
    Pending,

    /// Player unlinked off-chain
    OffchainApplied { previous_wallet_id: String },

    /// Revocation submitted; `success` is the chain outcome
    OnchainSubmitted {
        previous_wallet_id: String,
        success: bool,
    },

    /// Both sides agree the wallet is disconnected
    Committed,

    /// Chain step failed and the player is linked again
    RolledBack,
}

impl DisconnectState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectState::Committed | DisconnectState::RolledBack)
    }
}

impl std::fmt::Display for DisconnectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectState::Pending => write!(f, "pending"),
            DisconnectState::OffchainApplied { .. } => write!(f, "offchain_applied"),
            DisconnectState::OnchainSubmitted { success: true, .. } => {
                write!(f, "onchain_submitted(success)")
            }
            DisconnectState::OnchainSubmitted { success: false, .. } => {
                write!(f, "onchain_submitted(fail)")
            }
            DisconnectState::Committed => write!(f, "committed"),
            DisconnectState::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_document_parses_camel_case() {
        let doc: RegistryDocument = serde_json::from_str(
            r#"{
                "games": [{
                    "id": "game123",
                    "rpcs": { "matic": ["https://polygon-rpc.com"] },
                    "fundingWallet": { "address": "0x01", "ciphertext": "abc" }
                }],
                "players": [{
                    "id": "p1",
                    "gameId": "game123",
                    "custodialWallet": { "address": "0x02" }
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(doc.version, "1.0");
        assert_eq!(doc.games[0].rpcs[&Chain::Matic].len(), 1);
        assert_eq!(doc.players[0].connected_wallet_id, None);
        assert!(doc.wallets.is_empty());
    }

    #[test]
    fn test_disconnect_state_terminality() {
        assert!(!DisconnectState::Pending.is_terminal());
        assert!(!DisconnectState::OffchainApplied {
            previous_wallet_id: "w".into()
        }
        .is_terminal());
        assert!(DisconnectState::Committed.is_terminal());
        assert!(DisconnectState::RolledBack.is_terminal());
        assert_eq!(
            DisconnectState::OnchainSubmitted {
                previous_wallet_id: "w".into(),
                success: false
            }
            .to_string(),
            "onchain_submitted(fail)"
        );
    }
}
