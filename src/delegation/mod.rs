//! Delegation approval protocol
//!
//! ```text
//! ApprovalInput → DelegationRequest → verify_delegation → NonceLedger → ApprovalSubmitter
//!                                     (DelegationExecutor drives the whole path)
//! ```

pub mod executor;
pub mod nonce;
pub mod types;
pub mod verifier;

pub use executor::{ApprovalContext, DelegationExecutor};
pub use nonce::{FileNonceLedger, InMemoryNonceLedger, NonceLedger};
pub use types::{ApprovalInput, DelegationMessage, DelegationRequest, NonceValue, SystemId};
pub use verifier::{recover_signer, sign_delegation, verify_delegation};
