//! Chain dispatcher
//!
//! Resolves a chain to its ordered RPC endpoint list and submits one approval
//! call through the funding wallet. Transient node failures are retried with
//! exponential backoff on the same endpoint, then the next endpoint is tried.
//! Node verdicts on the transaction itself are never retried.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::Utc;
use ethabi::ethereum_types::U256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::rpc::{EvmRpcClient, HttpTransport, RpcTransport};
use super::transaction::{
    ContractCall, LegacyTransaction, SignedTransaction, TransactionRecord, TransactionStatus,
};
use super::types::{checksum_address, Chain};
use crate::config::{mask_url, ChainConfig, Config, DispatcherConfig};
use crate::error::{Error, Result};
use crate::wallet::funding::FundingSigner;

/// Headroom added on top of `eth_estimateGas`, in percent
const GAS_ESTIMATE_HEADROOM_PCT: u64 = 20;

/// Submits contract calls paid for by a funding wallet
#[async_trait]
pub trait ApprovalSubmitter: Send + Sync {
    /// Submit `call` on `chain`. `game_rpcs` are tried before the configured
    /// endpoints.
    async fn submit(
        &self,
        chain: Chain,
        game_rpcs: &[String],
        signer: &FundingSigner,
        call: &ContractCall,
    ) -> Result<TransactionRecord>;
}

/// State of one `submit` call, shared by every endpoint and retry
struct Submission<'a> {
    chain: Chain,
    chain_config: &'a ChainConfig,
    signer: &'a FundingSigner,
    call: &'a ContractCall,
    /// Signed on first use; later attempts resend the same bytes
    prepared: OnceCell<SignedTransaction>,
    attempts: AtomicU32,
}

/// Broadcast result on one endpoint
struct Broadcast {
    hash: String,
}

/// Multi-endpoint EVM submitter
pub struct ChainDispatcher {
    settings: DispatcherConfig,
    chains: HashMap<Chain, ChainConfig>,
    transport: Arc<dyn RpcTransport>,
}

impl ChainDispatcher {
    pub fn new(config: &Config, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            settings: config.dispatcher.clone(),
            chains: config.chains.clone(),
            transport,
        }
    }

    /// Dispatcher over HTTP JSON-RPC
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(config.dispatcher.request_timeout_ms)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    fn chain_config(&self, chain: Chain) -> Result<&ChainConfig> {
        self.chains
            .get(&chain)
            .ok_or_else(|| Error::UnsupportedChain(chain.to_string()))
    }

    /// Ordered, de-duplicated endpoint list: game endpoints first
    pub fn endpoints(&self, chain: Chain, game_rpcs: &[String]) -> Result<Vec<String>> {
        let chain_config = self.chain_config(chain)?;
        let mut endpoints: Vec<String> = Vec::new();
        for rpc in game_rpcs.iter().chain(chain_config.rpcs.iter()) {
            let rpc = rpc.trim();
            if !rpc.is_empty() && !endpoints.iter().any(|e| e == rpc) {
                endpoints.push(rpc.to_string());
            }
        }
        Ok(endpoints)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.settings.retry_base_delay_ms),
            max_interval: Duration::from_millis(self.settings.retry_base_delay_ms.saturating_mul(8)),
            // Attempts are bounded by the counter, not by elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Price and sign the approval against one endpoint's view of the chain
    async fn prepare(
        &self,
        client: &EvmRpcClient<'_>,
        submission: &Submission<'_>,
    ) -> Result<SignedTransaction> {
        let chain = submission.chain;
        let chain_config = submission.chain_config;
        let signer = submission.signer;
        let call = submission.call;
        let from = signer.address();

        let nonce = client.pending_nonce(&from).await?;
        let gas_price = scale_gas_price(
            client.gas_price().await?,
            chain_config.gas_price_multiplier,
        );
        let gas_limit = match chain_config.gas_limit {
            Some(limit) => U256::from(limit),
            None => {
                let estimate = client.estimate_gas(&from, &call.to, &call.data).await?;
                estimate + estimate * U256::from(GAS_ESTIMATE_HEADROOM_PCT) / U256::from(100u64)
            }
        };

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: call.to,
            value: U256::zero(),
            data: call.data.clone(),
            chain_id: chain.chain_id(),
        };
        let signed = tx.sign(signer)?;

        debug!(
            %chain,
            nonce = %nonce,
            gas_price = %gas_price,
            gas_limit = %gas_limit,
            tx_hash = %signed.hash,
            "Signed approval transaction"
        );
        Ok(signed)
    }

    /// Send the submission's single signed transaction to one endpoint
    ///
    /// The transaction is signed on first use and the same bytes are sent on
    /// every later attempt, so a send whose reply was lost can only ever be
    /// followed by a duplicate of itself.
    async fn broadcast(&self, endpoint: &str, submission: &Submission<'_>) -> Result<Broadcast> {
        let client = EvmRpcClient::new(self.transport.as_ref(), endpoint);
        let signed = submission
            .prepared
            .get_or_try_init(|| self.prepare(&client, submission))
            .await?;

        debug!(
            chain = %submission.chain,
            endpoint = %mask_url(endpoint),
            tx_hash = %signed.hash,
            "Broadcasting approval transaction"
        );

        match client.send_raw_transaction(&signed.raw).await {
            Ok(_) => Ok(Broadcast {
                hash: signed.hash.clone(),
            }),
            // A previous attempt reached the node before the response was lost
            Err(e) if is_already_known(&e) => {
                info!(tx_hash = %signed.hash, "Transaction already known to node");
                Ok(Broadcast {
                    hash: signed.hash.clone(),
                })
            }
            Err(e) if is_nonce_too_low(&e) => {
                // Either our earlier send was mined, or another transaction took the nonce
                match client.transaction_receipt(&signed.hash).await? {
                    Some(_) => {
                        info!(tx_hash = %signed.hash, "Transaction already mined");
                        Ok(Broadcast {
                            hash: signed.hash.clone(),
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Retry one endpoint until it succeeds, fails permanently, or runs out
    /// of attempts
    async fn submit_on_endpoint(
        &self,
        endpoint: &str,
        submission: &Submission<'_>,
    ) -> Result<Broadcast> {
        let limit = self.settings.attempts_per_endpoint.max(1);
        let used = AtomicU32::new(0);

        retry(self.backoff(), || async {
            let attempt = used.fetch_add(1, Ordering::SeqCst) + 1;
            submission.attempts.fetch_add(1, Ordering::SeqCst);

            match self.broadcast(endpoint, submission).await {
                Ok(broadcast) => Ok(broadcast),
                Err(e) if e.is_retryable() && attempt < limit => {
                    warn!(
                        chain = %submission.chain,
                        endpoint = %mask_url(endpoint),
                        attempt,
                        "Retryable RPC error: {}",
                        e
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    /// Poll for a receipt on the endpoint that accepted the transaction
    async fn await_receipt(
        &self,
        endpoint: &str,
        tx_hash: &str,
    ) -> Result<Option<(TransactionStatus, Option<u64>)>> {
        let client = EvmRpcClient::new(self.transport.as_ref(), endpoint);
        let poll = Duration::from_millis(self.settings.receipt_poll_interval_ms);

        let wait = async {
            loop {
                match client.transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) if receipt.success => {
                        return Ok(Some((TransactionStatus::Confirmed, receipt.block_number)));
                    }
                    Ok(Some(receipt)) => {
                        return Err(Error::TransactionRejected(format!(
                            "transaction {} reverted in block {}",
                            tx_hash,
                            receipt
                                .block_number
                                .map(|b| b.to_string())
                                .unwrap_or_else(|| "?".to_string())
                        )));
                    }
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(tx_hash, "Receipt poll failed: {}", e);
                    }
                    // The node accepted the transaction; only a receipt decides it failed
                    Err(e) => {
                        warn!(tx_hash, "Receipt polling stopped: {}", e);
                        return Ok(None);
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(
            Duration::from_millis(self.settings.receipt_timeout_ms),
            wait,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl ApprovalSubmitter for ChainDispatcher {
    async fn submit(
        &self,
        chain: Chain,
        game_rpcs: &[String],
        signer: &FundingSigner,
        call: &ContractCall,
    ) -> Result<TransactionRecord> {
        let chain_config = self.chain_config(chain)?;
        let endpoints = self.endpoints(chain, game_rpcs)?;
        let submission = Submission {
            chain,
            chain_config,
            signer,
            call,
            prepared: OnceCell::new(),
            attempts: AtomicU32::new(0),
        };
        let mut last_error = "no RPC endpoints configured".to_string();

        for endpoint in &endpoints {
            match self.submit_on_endpoint(endpoint, &submission).await {
                Ok(broadcast) => {
                    info!(
                        %chain,
                        endpoint = %mask_url(endpoint),
                        tx_hash = %broadcast.hash,
                        function = %call.function,
                        "Approval transaction submitted"
                    );

                    let mut status = TransactionStatus::Pending;
                    let mut block_number = None;
                    if self.settings.wait_for_receipt {
                        match self.await_receipt(endpoint, &broadcast.hash).await? {
                            Some((confirmed, block)) => {
                                status = confirmed;
                                block_number = block;
                            }
                            None => warn!(
                                tx_hash = %broadcast.hash,
                                "No receipt yet, reporting pending"
                            ),
                        }
                    }

                    return Ok(TransactionRecord {
                        id: Uuid::new_v4(),
                        hash: broadcast.hash,
                        status,
                        chain,
                        chain_id: chain.chain_id(),
                        from: checksum_address(&signer.address()),
                        to: checksum_address(&call.to),
                        function: call.function.clone(),
                        args: call.args.clone(),
                        block_number,
                        endpoint: mask_url(endpoint),
                        created_at: Utc::now(),
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        %chain,
                        endpoint = %mask_url(endpoint),
                        "Endpoint exhausted, falling back: {}",
                        e
                    );
                    last_error = e.to_string();
                }
                Err(e) => {
                    error!(%chain, endpoint = %mask_url(endpoint), "Submission rejected: {}", e);
                    return Err(e);
                }
            }
        }

        Err(Error::ChainUnavailable {
            chain: chain.to_string(),
            attempts: submission.attempts.load(Ordering::SeqCst),
            last_error,
        })
    }
}

/// Node reports it already holds this exact signed transaction
fn is_already_known(error: &Error) -> bool {
    match error {
        Error::TransactionRejected(msg) | Error::Rpc(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("already known") || msg.contains("known transaction")
        }
        _ => false,
    }
}

/// Node reports the sender's nonce has already been used on-chain
fn is_nonce_too_low(error: &Error) -> bool {
    match error {
        Error::TransactionRejected(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("nonce too low") || msg.contains("nonce has already been used")
        }
        _ => false,
    }
}

/// Apply a >= 1.0 multiplier with basis-point precision
fn scale_gas_price(price: U256, multiplier: f64) -> U256 {
    if multiplier <= 1.0 {
        return price;
    }
    let bps = (multiplier * 10_000.0).round() as u64;
    price * U256::from(bps) / U256::from(10_000u64)
}
