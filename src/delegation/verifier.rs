//! Signature verifier
//!
//! Recovers the signer of a delegation message and compares it with the
//! claimed connected wallet. Pure: no I/O, no state.

use ethabi::Address;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

use super::types::{DelegationMessage, SIGNATURE_LEN};
use crate::error::{Error, Result};
use crate::wallet::funding::address_of;

/// Recover the address that signed `message`
pub fn recover_signer(message: &DelegationMessage, signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LEN {
        return Err(Error::InvalidSignature);
    }

    let v = match signature[64] {
        0 | 27 => 0_u8,
        1 | 28 => 1_u8,
        _ => return Err(Error::InvalidSignature),
    };

    let mut sig = Signature::from_slice(&signature[..64]).map_err(|_| Error::InvalidSignature)?;
    let mut recid = v;
    // Flip parity when normalising a high-S signature
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        recid ^= 1;
    }
    let recovery_id = RecoveryId::from_byte(recid).ok_or(Error::InvalidSignature)?;

    let key = VerifyingKey::recover_from_prehash(&message.signing_hash(), &sig, recovery_id)
        .map_err(|_| Error::InvalidSignature)?;

    let address = address_of(&key);
    if address.is_zero() {
        return Err(Error::InvalidSignature);
    }
    Ok(address)
}

/// Succeeds only when the recovered signer equals `message.signer`
pub fn verify_delegation(message: &DelegationMessage, signature: &[u8]) -> Result<()> {
    let recovered = recover_signer(message, signature)?;
    // Byte comparison: hex case never matters
    if recovered != message.signer {
        return Err(Error::InvalidSignature);
    }
    Ok(())
}

/// Sign `message` the way a connected wallet would (65 bytes, v = 27/28)
pub fn sign_delegation(key: &SigningKey, message: &DelegationMessage) -> Result<Vec<u8>> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&message.signing_hash())
        .map_err(|e| Error::InvalidRequest(format!("signing failed: {}", e)))?;

    let mut out = signature.to_bytes().to_vec();
    out.push(27 + recovery_id.to_byte());
    Ok(out)
}

/// Address controlled by `key`
pub fn signer_address(key: &SigningKey) -> Address {
    address_of(key.verifying_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::parse_address;
    use crate::delegation::types::SystemId;
    use ethabi::ethereum_types::U256;

    fn key(byte: u8) -> SigningKey {
        SigningKey::from_slice(&[byte; 32]).unwrap()
    }

    fn message_for(key: &SigningKey) -> DelegationMessage {
        DelegationMessage {
            system_id: SystemId::from_game_id("game123"),
            delegate: parse_address("0x2222222222222222222222222222222222222222").unwrap(),
            approved: true,
            signer: signer_address(key),
            nonce: U256::from(7u64),
        }
    }

    #[test]
    fn test_signature_from_claimed_signer_verifies() {
        let signer = key(0x11);
        let message = message_for(&signer);
        let signature = sign_delegation(&signer, &message).unwrap();

        assert_eq!(signature.len(), 65);
        assert!(verify_delegation(&message, &signature).is_ok());
        assert_eq!(recover_signer(&message, &signature).unwrap(), message.signer);
    }

    #[test]
    fn test_signature_from_other_key_fails() {
        let claimed = key(0x11);
        let message = message_for(&claimed);
        let signature = sign_delegation(&key(0x22), &message).unwrap();

        assert!(matches!(
            verify_delegation(&message, &signature),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_tampered_message_fails() {
        let signer = key(0x11);
        let message = message_for(&signer);
        let signature = sign_delegation(&signer, &message).unwrap();

        let mut revoked = message.clone();
        revoked.approved = false;
        assert!(verify_delegation(&revoked, &signature).is_err());

        let mut bumped = message;
        bumped.nonce = U256::from(8u64);
        assert!(verify_delegation(&bumped, &signature).is_err());
    }

    #[test]
    fn test_recovery_byte_forms_accepted() {
        let signer = key(0x33);
        let message = message_for(&signer);
        let mut signature = sign_delegation(&signer, &message).unwrap();

        // 27/28 form as produced, then the raw 0/1 form
        assert!(verify_delegation(&message, &signature).is_ok());
        signature[64] -= 27;
        assert!(verify_delegation(&message, &signature).is_ok());

        signature[64] = 5;
        assert!(matches!(
            verify_delegation(&message, &signature),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_high_s_signature_normalised() {
        let signer = key(0x44);
        let message = message_for(&signer);
        let signature = sign_delegation(&signer, &message).unwrap();

        // (r, n - s) with flipped parity is the same signature in high-S form
        let low = Signature::from_slice(&signature[..64]).unwrap();
        let high_s = -*low.s();
        let mut malleated = signature[..32].to_vec();
        malleated.extend_from_slice(&high_s.to_bytes());
        malleated.push(if signature[64] == 27 { 28 } else { 27 });

        assert!(verify_delegation(&message, &malleated).is_ok());
    }

    #[test]
    fn test_malformed_signature_fails() {
        let signer = key(0x11);
        let message = message_for(&signer);

        assert!(matches!(
            verify_delegation(&message, &[0_u8; 64]),
            Err(Error::InvalidSignature)
        ));
        assert!(matches!(
            verify_delegation(&message, &[0_u8; 65]),
            Err(Error::InvalidSignature)
        ));
        assert!(matches!(
            verify_delegation(&message, &[]),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_random_keys_round_trip() {
        for _ in 0..8 {
            let signer = SigningKey::random(&mut rand::thread_rng());
            let message = message_for(&signer);
            let signature = sign_delegation(&signer, &message).unwrap();
            assert!(verify_delegation(&message, &signature).is_ok());
        }
    }
}
