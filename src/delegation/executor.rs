//! Delegation executor
//!
//! Validates an approval request, verifies the connected wallet's signature,
//! consumes the nonce and submits the approval through the funding wallet.
//! A consumed nonce is never refunded: after any later failure the caller
//! must sign again with a fresh nonce.

use ethabi::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::nonce::NonceLedger;
use super::types::{ApprovalInput, DelegationRequest, SystemId};
use super::verifier::verify_delegation;
use crate::chain::dispatcher::ApprovalSubmitter;
use crate::chain::transaction::TransactionRecord;
use crate::chain::types::{format_address, Chain};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::wallet::funding::{FundingSigner, KeyDecryptor};

/// Everything one approval needs besides the caller's signed input
#[derive(Debug, Clone, Copy)]
pub struct ApprovalContext<'a> {
    pub system_id: SystemId,
    /// Custodial wallet being approved or revoked
    pub delegate: Address,
    pub approved: bool,
    /// Game funding wallet ciphertext
    pub funding_ciphertext: &'a str,
    /// Game-specific RPC endpoints, tried before configured ones
    pub game_rpcs: &'a HashMap<Chain, Vec<String>>,
}

pub struct DelegationExecutor {
    approvers: HashMap<Chain, Address>,
    ledger: Arc<dyn NonceLedger>,
    submitter: Arc<dyn ApprovalSubmitter>,
    decryptor: Arc<dyn KeyDecryptor>,
}

impl DelegationExecutor {
    pub fn new(
        config: &Config,
        ledger: Arc<dyn NonceLedger>,
        submitter: Arc<dyn ApprovalSubmitter>,
        decryptor: Arc<dyn KeyDecryptor>,
    ) -> Result<Self> {
        let approvers = config
            .chains
            .iter()
            .map(|(chain, chain_config)| Ok((*chain, chain_config.approver_address()?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            approvers,
            ledger,
            submitter,
            decryptor,
        })
    }

    pub fn ledger(&self) -> &Arc<dyn NonceLedger> {
        &self.ledger
    }

    /// Chains with a configured approver contract
    pub fn supported_chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.approvers.keys().copied().collect();
        chains.sort();
        chains
    }

    /// Resolve the approver contract, failing fast on unknown or unconfigured
    /// chains
    pub fn resolve_chain(&self, input: &ApprovalInput) -> Result<(Chain, Address)> {
        let chain = input.chain()?;
        let approver = self
            .approvers
            .get(&chain)
            .copied()
            .ok_or_else(|| Error::UnsupportedChain(chain.to_string()))?;
        Ok((chain, approver))
    }

    /// Run one approval (grant or revoke) end to end
    pub async fn execute(
        &self,
        context: ApprovalContext<'_>,
        input: &ApprovalInput,
    ) -> Result<TransactionRecord> {
        let (chain, approver) = self.resolve_chain(input)?;
        let request =
            DelegationRequest::from_input(context.system_id, context.delegate, context.approved, input)?;
        let message = &request.message;
        let signer = format_address(&message.signer);

        verify_delegation(message, &request.signature).map_err(|e| {
            warn!(%chain, signer = %signer, "Delegation signature rejected");
            e
        })?;

        self.ledger
            .check_and_consume(&message.system_id, &message.signer, message.nonce)
            .await
            .map_err(|e| {
                warn!(signer = %signer, nonce = %message.nonce, "Nonce rejected: {}", e);
                e
            })?;

        let call = request.approval_call(approver)?;
        let game_rpcs = context
            .game_rpcs
            .get(&chain)
            .map(Vec::as_slice)
            .unwrap_or_default();

        // Key material lives only for this block
        let record = {
            let funding = FundingSigner::decrypt(self.decryptor.as_ref(), context.funding_ciphertext)?;
            self.submitter.submit(chain, game_rpcs, &funding, &call).await?
        };

        info!(
            %chain,
            signer = %signer,
            nonce = %message.nonce,
            approved = message.approved,
            tx_hash = %record.hash,
            "Delegation approval submitted"
        );

        Ok(record)
    }
}
