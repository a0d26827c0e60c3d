//! Keys, addresses and input signing

use crate::error::{ChainError, SelectionError};
use crate::transaction::{InputWitness, Transaction};
use crate::script::OutputScript;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Address derived from a public key hash (or script hash for P2SH outputs).
pub type Address = [u8; 32];

/// Hashes an arbitrary label into an address. Useful for tests.
pub fn address_from_string(s: &str) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hasher.finalize().into()
}

pub fn address_to_hex(addr: &Address) -> String {
    hex::encode(addr)
}

pub fn address_from_hex(hex_str: &str) -> Result<Address, ChainError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex address: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ChainError::CryptoError(format!(
            "Address must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    bytes
        .try_into()
        .map_err(|_| ChainError::CryptoError("Failed to convert bytes into address".to_string()))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self, ChainError> {
        let secret_key = SecretKey::new(&mut OsRng);
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// SHA-256 of the compressed public key.
    pub fn address(&self) -> Address {
        let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = self.public_key.serialize();
        Sha256::digest(pubkey_bytes).into()
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Signs the SHA-256 digest of `message`, returning the compact signature.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;
    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// Produces the witness for one input of an unsigned transaction.
pub trait Signer: Send + Sync {
    fn sign(
        &self,
        tx: &Transaction,
        input_index: usize,
        script: &OutputScript,
    ) -> Result<InputWitness, SelectionError>;
}

/// Key store signing for the addresses whose keys it holds.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<Address, KeyPair>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key and returns its address.
    pub fn insert(&self, keypair: KeyPair) -> Address {
        let address = keypair.address();
        self.keys.write().insert(address, keypair);
        address
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.keys.read().contains_key(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.keys.read().keys().copied().collect();
        addresses.sort();
        addresses
    }
}

impl Signer for KeyStore {
    fn sign(
        &self,
        tx: &Transaction,
        input_index: usize,
        script: &OutputScript,
    ) -> Result<InputWitness, SelectionError> {
        let destination = script.destination.ok_or_else(|| {
            SelectionError::Signing(format!("input {} has no signable destination", input_index))
        })?;
        let keys = self.keys.read();
        let keypair = keys.get(&destination).ok_or_else(|| {
            SelectionError::Signing(format!(
                "no key for address {}",
                address_to_hex(&destination)
            ))
        })?;
        let message = tx.signable_message(input_index);
        let signature = keypair
            .sign(&message)
            .map_err(|e| SelectionError::Signing(e.to_string()))?;
        Ok(InputWitness {
            signature: signature.to_vec(),
            public_key: keypair.public_key_bytes().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxIn, TxOut};

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"spend";

        let signature = keypair.sign(message).unwrap();
        let result = verify_signature(&keypair.public_key_bytes(), message, &signature);
        assert!(result.is_ok());
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE);
    }

    #[test]
    fn test_invalid_signature() {
        let keypair1 = KeyPair::generate().unwrap();
        let keypair2 = KeyPair::generate().unwrap();

        let signature = keypair1.sign(b"Test message").unwrap();
        let result = verify_signature(&keypair2.public_key_bytes(), b"Test message", &signature);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_address_hex_roundtrip_rejects_short() {
        let addr = address_from_string("alice");
        assert_eq!(address_from_hex(&address_to_hex(&addr)).unwrap(), addr);
        assert!(address_from_hex("abcd").is_err());
    }

    #[test]
    fn test_key_store_signs_input() {
        let store = KeyStore::new();
        let keypair = KeyPair::generate().unwrap();
        let address = store.insert(keypair.clone());

        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(OutPoint::new([1u8; 32], 0)));
        tx.outputs.push(TxOut::new(10, OutputScript::pay_to(address)));

        let witness = store
            .sign(&tx, 0, &OutputScript::pay_to(address))
            .unwrap();
        assert!(verify_signature(&witness.public_key, &tx.signable_message(0), &witness.signature).is_ok());
    }

    #[test]
    fn test_verify_input_checks_witness() {
        let store = KeyStore::new();
        let address = store.insert(KeyPair::generate().unwrap());
        let script = OutputScript::pay_to(address);

        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(OutPoint::new([1u8; 32], 0)));
        tx.inputs.push(TxIn::new(OutPoint::new([2u8; 32], 1)));
        tx.outputs.push(TxOut::new(10, script.clone()));
        assert!(tx.verify_input(0).is_err());

        let first = store.sign(&tx, 0, &script).unwrap();
        let second = store.sign(&tx, 1, &script).unwrap();
        tx.inputs[0].sign(first.clone());
        tx.inputs[1].sign(second);
        assert!(tx.verify_input(0).is_ok());
        assert!(tx.verify_input(1).is_ok());

        // a witness made for another input does not verify
        tx.inputs[1].sign(first);
        assert!(tx.verify_input(1).is_err());
    }

    #[test]
    fn test_key_store_missing_key() {
        let store = KeyStore::new();
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(OutPoint::new([1u8; 32], 0)));
        let result = store.sign(&tx, 0, &OutputScript::pay_to(address_from_string("stranger")));
        assert!(matches!(result, Err(SelectionError::Signing(_))));
    }
}
