//! Proof-of-stake block signatures.
//!
//! A stake block is signed by the key that owns the coinstake payout, tying
//! the block to the staker. Work blocks carry no signature.

use std::sync::OnceLock;

use novad_consensus::Hash256;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1};

const OP_CHECKSIG: u8 = 0xac;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Work blocks must not be signed; stake blocks must be.
    UnexpectedSignature,
    MissingSignature,
    /// The coinstake payout script is not pay-to-pubkey.
    NotPayToPubkey,
    BadPublicKey,
    BadSignature,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::UnexpectedSignature => {
                write!(f, "unexpected signature on proof-of-work block")
            }
            SignatureError::MissingSignature => write!(f, "missing block signature"),
            SignatureError::NotPayToPubkey => {
                write!(f, "coinstake payout script is not pay-to-pubkey")
            }
            SignatureError::BadPublicKey => write!(f, "invalid public key in coinstake output"),
            SignatureError::BadSignature => write!(f, "block signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

fn secp() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

/// Extracts the key from a `<push pubkey> OP_CHECKSIG` script.
pub fn pay_to_pubkey_key(script_pubkey: &[u8]) -> Option<&[u8]> {
    let (&len, rest) = script_pubkey.split_first()?;
    let len = len as usize;
    if !(len == 33 || len == 65) || rest.len() != len + 1 || rest[len] != OP_CHECKSIG {
        return None;
    }
    Some(&rest[..len])
}

/// Verifies a stake block's DER signature over its hash against the key
/// paid by the coinstake's first value output.
pub fn check_block_signature(
    block_hash: &Hash256,
    block_signature: &[u8],
    coinstake_payout_script: &[u8],
) -> Result<(), SignatureError> {
    if block_signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    let key_bytes =
        pay_to_pubkey_key(coinstake_payout_script).ok_or(SignatureError::NotPayToPubkey)?;
    let key = PublicKey::from_slice(key_bytes).map_err(|_| SignatureError::BadPublicKey)?;
    let signature =
        Signature::from_der(block_signature).map_err(|_| SignatureError::BadSignature)?;
    let message = Message::from_digest(*block_hash);
    secp()
        .verify_ecdsa(&message, &signature, &key)
        .map_err(|_| SignatureError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::from_slice(&[0x42u8; 32]).expect("secret key");
        let public = PublicKey::from_secret_key(secp(), &secret);
        (secret, public)
    }

    fn pay_to_pubkey(public: &PublicKey) -> Vec<u8> {
        let serialized = public.serialize();
        let mut script = Vec::with_capacity(35);
        script.push(serialized.len() as u8);
        script.extend_from_slice(&serialized);
        script.push(OP_CHECKSIG);
        script
    }

    #[test]
    fn round_trip_signature_verifies() {
        let (secret, public) = keypair();
        let block_hash = [7u8; 32];
        let signature = secp()
            .sign_ecdsa(&Message::from_digest(block_hash), &secret)
            .serialize_der()
            .to_vec();

        let script = pay_to_pubkey(&public);
        check_block_signature(&block_hash, &signature, &script).expect("valid signature");

        // A different block hash must not verify.
        assert_eq!(
            check_block_signature(&[8u8; 32], &signature, &script),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn rejects_non_pay_to_pubkey_scripts() {
        let (secret, _) = keypair();
        let block_hash = [7u8; 32];
        let signature = secp()
            .sign_ecdsa(&Message::from_digest(block_hash), &secret)
            .serialize_der()
            .to_vec();
        let p2pkh = [0x76, 0xa9, 0x14, 0x00, 0x88, 0xac];
        assert_eq!(
            check_block_signature(&block_hash, &signature, &p2pkh),
            Err(SignatureError::NotPayToPubkey)
        );
    }

    #[test]
    fn rejects_empty_signature() {
        assert_eq!(
            check_block_signature(&[7u8; 32], &[], &[]),
            Err(SignatureError::MissingSignature)
        );
    }
}
