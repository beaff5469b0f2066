//! Delegation request types and the canonical approval message

use ethabi::ethereum_types::U256;
use ethabi::{Address, Function, Param, ParamType, StateMutability, Token};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::chain::transaction::ContractCall;
use crate::chain::types::{checksum_address, keccak256, parse_address, Chain};
use crate::error::{Error, Result};

/// Prefix of an Ethereum personal message over a 32-byte payload
const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// On-chain function recording a delegate approval
pub const APPROVAL_FUNCTION: &str = "setDelegateApprovalForSystem";

/// Signature length: r (32) || s (32) || v (1)
pub const SIGNATURE_LEN: usize = 65;

/// Hash scoping approvals to one game's contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub [u8; 32]);

impl SystemId {
    /// keccak256 of the UTF-8 game id
    pub fn from_game_id(game_id: &str) -> Self {
        Self(keccak256(game_id.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Positive nonce, accepted from JSON as a number or a decimal string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonceValue(pub U256);

impl NonceValue {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let value = match trimmed.strip_prefix("0x") {
            Some(hex_part) => U256::from_str_radix(hex_part, 16).ok(),
            None => U256::from_dec_str(trimmed).ok(),
        };
        value
            .map(Self)
            .ok_or_else(|| Error::InvalidRequest(format!("nonce '{}' is not an integer", input)))
    }

    pub fn value(&self) -> U256 {
        self.0
    }
}

impl From<u64> for NonceValue {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for NonceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for NonceValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for NonceValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::from(n)),
            Raw::Text(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// The tuple a connected wallet signs to approve or revoke a delegate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationMessage {
    pub system_id: SystemId,
    pub delegate: Address,
    pub approved: bool,
    pub signer: Address,
    pub nonce: U256,
}

impl DelegationMessage {
    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::FixedBytes(self.system_id.0.to_vec()),
            Token::Address(self.delegate),
            Token::Bool(self.approved),
            Token::Address(self.signer),
            Token::Uint(self.nonce),
        ]
    }

    /// ABI encoding of `(bytes32, address, bool, address, uint256)`
    pub fn encode(&self) -> Vec<u8> {
        ethabi::encode(&self.tokens())
    }

    /// keccak256 of the ABI encoding
    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.encode())
    }

    /// Digest actually signed: the hash wrapped as a personal message
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut prefixed = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + 32);
        prefixed.extend_from_slice(PERSONAL_MESSAGE_PREFIX);
        prefixed.extend_from_slice(&self.hash());
        keccak256(&prefixed)
    }
}

/// Raw approval input as received from a caller, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub signer: Option<String>,
    pub nonce: Option<NonceValue>,
    pub signature: Option<String>,
    pub chain: Option<String>,
}

impl ApprovalInput {
    /// Reject missing fields before anything else is looked at
    pub fn require_fields(&self) -> Result<()> {
        let missing_text = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
        if missing_text(&self.signer)
            || self.nonce.is_none()
            || missing_text(&self.signature)
            || missing_text(&self.chain)
        {
            return Err(Error::InvalidRequest(
                "address, nonce, signature and chain must be provided".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the chain field; unknown names are `UnsupportedChain`
    pub fn chain(&self) -> Result<Chain> {
        self.require_fields()?;
        self.chain.as_deref().unwrap_or_default().parse()
    }
}

/// A validated, immutable delegation approval request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    pub message: DelegationMessage,
    pub signature: Vec<u8>,
    pub chain: Chain,
}

impl DelegationRequest {
    /// Validate raw input into a request for `system_id` and `delegate`
    pub fn from_input(
        system_id: SystemId,
        delegate: Address,
        approved: bool,
        input: &ApprovalInput,
    ) -> Result<Self> {
        let chain = input.chain()?;
        let signer = parse_address(input.signer.as_deref().unwrap_or_default())?;
        let nonce = input.nonce.map(|n| n.value()).unwrap_or_default();
        if nonce.is_zero() {
            return Err(Error::InvalidRequest("nonce must be a positive integer".to_string()));
        }
        let signature = parse_signature(input.signature.as_deref().unwrap_or_default())?;

        Ok(Self {
            message: DelegationMessage {
                system_id,
                delegate,
                approved,
                signer,
                nonce,
            },
            signature,
            chain,
        })
    }

    /// Calldata for `setDelegateApprovalForSystem` on `contract`
    pub fn approval_call(&self, contract: Address) -> Result<ContractCall> {
        let data = approval_function()
            .encode_input(&[
                Token::FixedBytes(self.message.system_id.0.to_vec()),
                Token::Address(self.message.delegate),
                Token::Bool(self.message.approved),
                Token::Address(self.message.signer),
                Token::Uint(self.message.nonce),
                Token::Bytes(self.signature.clone()),
            ])
            .map_err(|e| Error::Serialization(format!("approval calldata: {}", e)))?;

        Ok(ContractCall {
            to: contract,
            data,
            function: APPROVAL_FUNCTION.to_string(),
            args: serde_json::json!({
                "systemId": self.message.system_id.to_hex(),
                "delegate": checksum_address(&self.message.delegate),
                "approved": self.message.approved,
                "signer": checksum_address(&self.message.signer),
                "nonce": self.message.nonce.to_string(),
                "signature": format!("0x{}", hex::encode(&self.signature)),
            }),
        })
    }
}

/// Decode a hex signature; length is checked by the verifier
pub fn parse_signature(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .map_err(|_| Error::InvalidSignature)
}

#[allow(deprecated)]
fn approval_function() -> Function {
    let param = |name: &str, kind: ParamType| Param {
        name: name.to_string(),
        kind,
        internal_type: None,
    };

    Function {
        name: APPROVAL_FUNCTION.to_string(),
        inputs: vec![
            param("systemId", ParamType::FixedBytes(32)),
            param("delegate", ParamType::Address),
            param("approved", ParamType::Bool),
            param("signer", ParamType::Address),
            param("nonce", ParamType::Uint(256)),
            param("signature", ParamType::Bytes),
        ],
        outputs: vec![],
        constant: None,
        state_mutability: StateMutability::NonPayable,
    }
}
