//! Transaction building for delegation approval submissions
//!
//! The funding wallet signs EIP-155 legacy transactions locally and the
//! dispatcher broadcasts the raw bytes with `eth_sendRawTransaction`.

use chrono::{DateTime, Utc};
use ethabi::ethereum_types::U256;
use ethabi::Address;
use rlp::RlpStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{keccak256, Chain};
use crate::error::Result;
use crate::wallet::funding::FundingSigner;

/// A contract call the funding wallet pays for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    /// Contract receiving the call
    pub to: Address,
    /// ABI-encoded calldata (selector + arguments)
    pub data: Vec<u8>,
    /// Function name, for the transaction record
    pub function: String,
    /// Human-readable arguments, for the transaction record
    pub args: serde_json::Value,
}

/// Unsigned EIP-155 legacy transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: U256,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

/// Signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    /// `0x` keccak hash of `raw`
    pub hash: String,
}

impl LegacyTransaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&rlp_uint(self.nonce));
        stream.append(&rlp_uint(self.gas_price));
        stream.append(&rlp_uint(self.gas_limit));
        stream.append(&self.to.as_bytes().to_vec());
        stream.append(&rlp_uint(self.value));
        stream.append(&self.data);
    }

    /// Hash the funding wallet signs (EIP-155 replay-protected)
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&rlp_uint(U256::from(self.chain_id)));
        stream.append(&Vec::<u8>::new());
        stream.append(&Vec::<u8>::new());
        keccak256(&stream.out())
    }

    /// Sign and RLP-encode the transaction
    pub fn sign(&self, signer: &FundingSigner) -> Result<SignedTransaction> {
        let (signature, recovery_id) = signer.sign_prehash(&self.signing_hash())?;
        let sig_bytes = signature.to_bytes();

        let v = u64::from(recovery_id.to_byte()) + self.chain_id * 2 + 35;

        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&rlp_uint(U256::from(v)));
        stream.append(&trim_leading_zeros(&sig_bytes[..32]));
        stream.append(&trim_leading_zeros(&sig_bytes[32..]));

        let raw = stream.out().to_vec();
        let hash = format!("0x{}", hex::encode(keccak256(&raw)));
        Ok(SignedTransaction { raw, hash })
    }
}

/// RLP integers are big-endian with no leading zero bytes
fn rlp_uint(value: U256) -> Vec<u8> {
    let mut buf = [0_u8; 32];
    value.to_big_endian(&mut buf);
    trim_leading_zeros(&buf)
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Status of a submitted approval transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Broadcast, receipt not yet observed
    Pending,
    /// Mined with a success receipt
    Confirmed,
}

/// Record of a submitted approval transaction, returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: Uuid,
    pub hash: String,
    pub status: TransactionStatus,
    pub chain: Chain,
    pub chain_id: u64,
    pub from: String,
    pub to: String,
    pub function: String,
    pub args: serde_json::Value,
    pub block_number: Option<u64>,
    /// Endpoint that accepted the transaction (credentials masked)
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::parse_address;

    fn eip155_example() -> LegacyTransaction {
        LegacyTransaction {
            nonce: U256::from(9u64),
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: U256::from(21_000u64),
            to: parse_address("0x3535353535353535353535353535353535353535").unwrap(),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: Vec::new(),
            chain_id: 1,
        }
    }

    #[test]
    fn test_rlp_uint_trims() {
        assert_eq!(rlp_uint(U256::zero()), Vec::<u8>::new());
        assert_eq!(rlp_uint(U256::from(0x0400u64)), vec![0x04, 0x00]);
    }

    #[test]
    fn test_eip155_signing_hash() {
        assert_eq!(
            hex::encode(eip155_example().signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_eip155_signed_transaction() {
        let signer = FundingSigner::from_secret_bytes(&[0x46; 32]).unwrap();
        let signed = eip155_example().sign(&signer).unwrap();
        assert_eq!(
            hex::encode(&signed.raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
        assert_eq!(signed.hash, format!("0x{}", hex::encode(keccak256(&signed.raw))));
    }
}
