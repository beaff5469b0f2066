//! Delegation Relay Library
//!
//! Gasless delegation approvals: a player's connected external wallet signs an
//! approval off-chain and the game's funding wallet submits it to the
//! `DelegateApprover` contract, so the custodial wallet can act on its behalf.

pub mod api;
pub mod chain;
pub mod cli;
pub mod config;
pub mod delegation;
pub mod error;
pub mod wallet;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
