//! Transaction types for AssetLedger

use crate::asset::{AssetId, AssetKey};
use crate::crypto::verify_signature;
use crate::error::ChainError;
use crate::script::OutputScript;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub type TxId = [u8; 32];

/// Reference to one output of a previous transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputWitness {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub witness: Option<InputWitness>,
}

impl TxIn {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            witness: None,
        }
    }

    pub fn sign(&mut self, witness: InputWitness) {
        self.witness = Some(witness);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub script: OutputScript,
}

impl TxOut {
    pub fn new(value: i64, script: OutputScript) -> Self {
        Self { value, script }
    }

    /// Quantities this output moves, keyed like the selection rows. The
    /// native row carries the output value.
    pub fn amounts(&self) -> BTreeMap<AssetKey, i64> {
        let mut amounts = BTreeMap::new();
        amounts.insert(AssetKey::Native, self.value);
        for transfer in self.script.transfer_quantities() {
            *amounts.entry(AssetKey::Entity(transfer.asset)).or_insert(0) += transfer.quantity;
        }
        if let Some(issuance) = self.script.issuance {
            *amounts.entry(AssetKey::Genesis(issuance.asset)).or_insert(0) += issuance.quantity;
        }
        amounts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            ..Self::default()
        }
    }

    /// Hash of the unsigned body; witnesses do not change the id.
    pub fn txid(&self) -> TxId {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.previous_output.txid);
            hasher.update(input.previous_output.index.to_le_bytes());
        }
        for output in &self.outputs {
            hasher.update(output.value.to_le_bytes());
            if let Ok(script) = bincode::serialize(&output.script) {
                hasher.update(script);
            }
        }
        hasher.update(self.lock_time.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn txid_str(&self) -> String {
        hex::encode(self.txid())
    }

    pub fn signable_message(&self, input_index: usize) -> Vec<u8> {
        let mut message = Vec::with_capacity(40);
        message.extend_from_slice(&self.txid());
        message.extend_from_slice(&(input_index as u64).to_le_bytes());
        message
    }

    pub fn serialized_size(&self) -> Result<usize, ChainError> {
        Ok(bincode::serialized_size(self)? as usize)
    }

    pub fn validate_size(&self, max_size: usize) -> Result<(), ChainError> {
        let size = self.serialized_size()?;
        if size > max_size {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                size, max_size
            )));
        }
        Ok(())
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Sum of each real asset over all outputs.
    pub fn asset_totals(&self) -> BTreeMap<AssetId, i64> {
        let mut totals = BTreeMap::new();
        for quantity in self.outputs.iter().flat_map(|o| o.script.transfer_quantities()) {
            *totals.entry(quantity.asset).or_insert(0) += quantity.quantity;
        }
        totals
    }

    pub fn is_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|i| i.witness.is_some())
    }

    /// Checks the witness of one input against its signable message.
    pub fn verify_input(&self, input_index: usize) -> Result<(), ChainError> {
        let witness = self
            .inputs
            .get(input_index)
            .and_then(|input| input.witness.as_ref())
            .ok_or_else(|| ChainError::InvalidTransaction(format!("input {} is not signed", input_index)))?;
        verify_signature(&witness.public_key, &self.signable_message(input_index), &witness.signature)
    }
}
