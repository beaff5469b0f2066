//! Request/response contract for the player wallet endpoints
//!
//! `POST /players/{playerId}/wallets` connects, `DELETE
//! /players/{playerId}/wallets/{walletId}` disconnects. Routing and
//! authentication live outside this crate; `DelegationService` receives the
//! already-authenticated player and enforces that it matches the path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::chain::transaction::TransactionRecord;
use crate::chain::types::{checksum_address, parse_address};
use crate::delegation::types::{ApprovalInput, NonceValue};
use crate::error::{Error, Result};
use crate::wallet::linkage::WalletLinkageManager;

/// Body shared by connect and disconnect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletApprovalBody {
    /// External wallet address
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub nonce: Option<NonceValue>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub chain: Option<String>,
}

pub type ConnectRequest = WalletApprovalBody;
pub type DisconnectRequest = WalletApprovalBody;

impl WalletApprovalBody {
    fn approval_input(&self) -> ApprovalInput {
        ApprovalInput {
            signer: self.address.clone(),
            nonce: self.nonce,
            signature: self.signature.clone(),
            chain: self.chain.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Connected wallet id
    pub id: String,
    pub address: String,
    pub transaction: TransactionRecord,
}

/// Player established by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPlayer {
    pub player_id: String,
}

/// Structured failure body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        let message = if e.status_code() == 500 {
            "Internal error".to_string()
        } else {
            e.to_string()
        };
        Self {
            code: e.code().to_string(),
            message,
        }
    }
}

/// Render a handler result as (HTTP status, JSON body)
pub fn to_response<T: Serialize>(result: Result<T>) -> (u16, serde_json::Value) {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(body) => (200, body),
            Err(e) => {
                let err = Error::Serialization(e.to_string());
                (500, serde_json::json!(ErrorBody::from(&err)))
            }
        },
        Err(e) => {
            if e.status_code() >= 500 {
                error!(code = e.code(), "Request failed: {}", e);
            }
            (e.status_code(), serde_json::json!(ErrorBody::from(&e)))
        }
    }
}

pub struct DelegationService {
    manager: Arc<WalletLinkageManager>,
}

impl DelegationService {
    pub fn new(manager: Arc<WalletLinkageManager>) -> Self {
        Self { manager }
    }

    fn authorize(auth: &AuthenticatedPlayer, player_id: &str) -> Result<()> {
        if auth.player_id != player_id {
            return Err(Error::Unauthorized(
                "authenticated player does not match path".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the player's connected wallet
    pub async fn connect(
        &self,
        auth: &AuthenticatedPlayer,
        player_id: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectResponse> {
        Self::authorize(auth, player_id)?;
        let outcome = self
            .manager
            .connect(player_id, &request.approval_input())
            .await?;

        let address = parse_address(&outcome.wallet.address)
            .map(|a| checksum_address(&a))
            .unwrap_or(outcome.wallet.address);

        Ok(ConnectResponse {
            id: outcome.wallet.id,
            address,
            transaction: outcome.transaction,
        })
    }

    /// Remove the player's connected wallet
    pub async fn disconnect(
        &self,
        auth: &AuthenticatedPlayer,
        player_id: &str,
        wallet_id: &str,
        request: &DisconnectRequest,
    ) -> Result<()> {
        Self::authorize(auth, player_id)?;
        self.manager
            .disconnect(player_id, Some(wallet_id), &request.approval_input())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::format_address;
    use crate::delegation::executor::tests::{
        funding_ciphertext, signed_input, test_config, test_decryptor, RecordingSubmitter,
    };
    use crate::delegation::executor::DelegationExecutor;
    use crate::delegation::nonce::InMemoryNonceLedger;
    use crate::wallet::registry::tests::{game, player};
    use crate::wallet::registry::JsonRegistry;
    use crate::wallet::types::RegistryDocument;
    use k256::ecdsa::SigningKey;

    fn service() -> DelegationService {
        let mut doc = RegistryDocument::default();
        doc.games.push(game("game123", &funding_ciphertext()));
        doc.players.push(player("p1", "game123"));
        let registry = Arc::new(JsonRegistry::in_memory(doc));

        let executor = DelegationExecutor::new(
            &test_config(),
            Arc::new(InMemoryNonceLedger::new()),
            Arc::new(RecordingSubmitter::default()),
            Arc::new(test_decryptor()),
        )
        .unwrap();
        let manager = WalletLinkageManager::new(
            Default::default(),
            registry.clone(),
            registry,
            Arc::new(executor),
        );
        DelegationService::new(Arc::new(manager))
    }

    fn body(wallet: &SigningKey, approved: bool, nonce: u64) -> WalletApprovalBody {
        let delegate = parse_address(&format!("0x{}", "22".repeat(20))).unwrap();
        let input = signed_input(wallet, "game123", delegate, approved, nonce, "MATIC");
        WalletApprovalBody {
            address: input.signer,
            nonce: input.nonce,
            signature: input.signature,
            chain: input.chain,
        }
    }

    fn auth(player_id: &str) -> AuthenticatedPlayer {
        AuthenticatedPlayer {
            player_id: player_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let service = service();
        let wallet = SigningKey::from_slice(&[0x21; 32]).unwrap();

        let connected = service
            .connect(&auth("p1"), "p1", &body(&wallet, true, 7))
            .await
            .unwrap();
        assert_eq!(
            connected.address.to_lowercase(),
            format_address(&crate::delegation::verifier::signer_address(&wallet))
        );

        service
            .disconnect(&auth("p1"), "p1", &connected.id, &body(&wallet, false, 8))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_other_player_is_unauthorized() {
        let service = service();
        let wallet = SigningKey::from_slice(&[0x21; 32]).unwrap();
        let err = service
            .connect(&auth("p2"), "p1", &body(&wallet, true, 7))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn test_body_accepts_numeric_or_string_nonce() {
        let numeric: WalletApprovalBody = serde_json::from_str(
            r#"{"address":"0xabc","nonce":7,"signature":"0x00","chain":"MATIC"}"#,
        )
        .unwrap();
        let text: WalletApprovalBody =
            serde_json::from_str(r#"{"address":"0xabc","nonce":"7"}"#).unwrap();
        assert_eq!(numeric.nonce, text.nonce);
        assert!(text.chain.is_none());
    }

    #[test]
    fn test_error_responses() {
        let (status, body) = to_response::<()>(Err(Error::NoConnectedWallet));
        assert_eq!(status, 400);
        assert_eq!(body["code"], "NO_CONNECTED_WALLET");

        let (status, body) = to_response::<()>(Err(Error::KeyDecrypt("tag mismatch".into())));
        assert_eq!(status, 500);
        assert_eq!(body["message"], "Internal error");

        let (status, body) = to_response(Ok(serde_json::json!({"ok": true})));
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
    }
}
