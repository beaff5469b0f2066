//! EVM chain access
//!
//! - `types`: supported chain table and address/hash helpers
//! - `rpc`: JSON-RPC transport and typed calls
//! - `transaction`: EIP-155 legacy transaction signing and records
//! - `dispatcher`: multi-endpoint submission with fallback

pub mod dispatcher;
pub mod rpc;
pub mod transaction;
pub mod types;

pub use dispatcher::{ApprovalSubmitter, ChainDispatcher};
pub use rpc::{EvmRpcClient, HttpTransport, RpcTransport};
pub use transaction::{ContractCall, TransactionRecord, TransactionStatus};
pub use types::Chain;
