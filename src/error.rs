//! Error types for the delegation relay

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the delegation relay
#[derive(Error, Debug)]
pub enum Error {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Signature invalid")]
    InvalidSignature,

    #[error("Nonce {nonce} already used for this wallet, sign again with a new nonce")]
    NonceReused { nonce: String },

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("No connected wallet to remove")]
    NoConnectedWallet,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Lookup errors
    #[error("Player not found: {0}")]
    PlayerNotFound(String),

    #[error("Game not found: {0}")]
    GameNotFound(String),

    // Chain errors
    #[error("Chain {chain} unavailable after {attempts} attempts: {last_error}")]
    ChainUnavailable {
        chain: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Transaction rejected: {0}")]
    TransactionRejected(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    // Key material errors
    #[error("Funding key decrypt failed: {0}")]
    KeyDecrypt(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Storage errors
    #[error("Persistence failed: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::RpcTimeout(_) | Error::RpcConnection(_)
        )
    }

    /// Check if this error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::InvalidSignature
                | Error::NonceReused { .. }
                | Error::UnsupportedChain(_)
                | Error::NoConnectedWallet
        )
    }

    /// HTTP status this error surfaces as at the request boundary
    pub fn status_code(&self) -> u16 {
        match self {
            e if e.is_client_error() => 400,
            Error::Unauthorized(_) => 401,
            Error::PlayerNotFound(_) | Error::GameNotFound(_) => 404,
            Error::TransactionRejected(_) => 422,
            Error::ChainUnavailable { .. }
            | Error::Rpc(_)
            | Error::RpcTimeout(_)
            | Error::RpcConnection(_) => 502,
            _ => 500,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::InvalidSignature => "INVALID_SIGNATURE",
            Error::NonceReused { .. } => "NONCE_REUSED",
            Error::UnsupportedChain(_) => "UNSUPPORTED_CHAIN",
            Error::NoConnectedWallet => "NO_CONNECTED_WALLET",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::PlayerNotFound(_) => "PLAYER_NOT_FOUND",
            Error::GameNotFound(_) => "GAME_NOT_FOUND",
            Error::ChainUnavailable { .. } => "CHAIN_UNAVAILABLE",
            Error::TransactionRejected(_) => "TRANSACTION_REJECTED",
            Error::Rpc(_) | Error::RpcTimeout(_) | Error::RpcConnection(_) => "RPC_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
