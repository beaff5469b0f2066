//! Wallet records and linkage
//!
//! Provides:
//! - Funding wallet key decryption (just-in-time, zeroized)
//! - Player/game/wallet registry (registry.json)
//! - Connect and compensated disconnect of external wallets
//!
//! # Architecture
//!
//! ```text
//! GameDirectory + LinkageStore → WalletLinkageManager → DelegationExecutor
//!                                                          ↑
//!                                                   KeyDecryptor
//! ```

pub mod funding;
pub mod linkage;
pub mod registry;
pub mod types;

pub use funding::{AesGcmKeyDecryptor, FundingSigner, KeyDecryptor};
pub use linkage::{ConnectOutcome, DisconnectOutcome, WalletLinkageManager};
pub use registry::{GameDirectory, JsonRegistry, LinkageStore};
pub use types::{DisconnectState, GameRecord, PlayerRecord, RegistryDocument, WalletRecord};
