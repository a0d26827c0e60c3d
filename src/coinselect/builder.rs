//! Change outputs, signing and the fee loop

use super::change::ChangeAmounts;
use super::matrix::CoinMatrix;
use super::{CoinRecord, EngineContext};
use crate::crypto::Address;
use crate::error::{SelectionError, SelectionResult};
use crate::fees::compute_priority;
use crate::script::OutputScript;
use crate::transaction::{Transaction, TxIn, TxOut};
use tracing::debug;

/// Change value used when outputs are sized from the dust threshold.
pub const DUST_CHANGE_OUTPUT: i64 = 182;

/// Signature bytes assumed per unsigned input.
pub const ESTIMATED_SIGNATURE_SIZE: usize = 112;
pub const ESTIMATED_SCRIPT_SIGNATURE_SIZE: usize = 256;

/// Size of a spending input, added when pricing a dust-based output.
const SPENDING_INPUT_SIZE: usize = 148;

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Complete { tx: Transaction, fee: i64 },
    /// Selected native currency is short by this much.
    NeedNative(i64),
}

/// Inputs of one fee-loop run.
pub struct TransactionDraft<'a> {
    pub ctx: &'a EngineContext,
    pub coins: &'a [CoinRecord],
    pub matrix: &'a CoinMatrix,
    pub outputs: &'a [TxOut],
    pub change: &'a ChangeAmounts,
    pub change_address: Option<Address>,
    pub sign: bool,
}

impl TransactionDraft<'_> {
    fn change_destination(&self) -> SelectionResult<Address> {
        self.change_address.ok_or(SelectionError::ChangeAddressNotFound)
    }

    fn group_change_value(&self, script: &OutputScript) -> SelectionResult<i64> {
        match self.ctx.params.min_output() {
            Some(value) => Ok(value),
            None => {
                let size = bincode::serialized_size(&TxOut::new(0, script.clone()))
                    .map_err(crate::error::ChainError::from)? as usize;
                Ok(3 * self.ctx.fees.min_relay_fee(size + SPENDING_INPUT_SIZE))
            }
        }
    }
}

/// Assembles the transaction for the current selection, raising `fee`
/// until it satisfies the fee policy. Returns the native shortfall when
/// the selection cannot pay for change and fee.
pub fn build_asset_transaction(
    draft: &TransactionDraft,
    fee: &mut i64,
) -> SelectionResult<BuildOutcome> {
    let ctx = draft.ctx;
    let params = &ctx.params;
    let change = draft.change;

    for (key, entry) in &change.amounts {
        if entry.quantity < 0 {
            return Err(SelectionError::internal(format!(
                "negative change {} for {}",
                entry.quantity, key
            )));
        }
    }

    let active_groups = change.active_groups();
    let native_change = change.native();
    let min_output = params.min_output();
    let default_change_output = min_output.unwrap_or(DUST_CHANGE_OUTPUT);

    let mut change_count = usize::from(native_change > *fee) + active_groups.len();
    match draft.change_address {
        None if change_count > 0 => return Err(SelectionError::ChangeAddressNotFound),
        Some(_) if change_count == 0 => change_count = 1,
        _ => {}
    }

    let echo_addresses: Vec<Address> = change
        .used_addresses
        .iter()
        .filter(|a| Some(**a) != draft.change_address)
        .filter(|a| {
            ctx.oracle.can_receive(a)
                || (params.anyone_can_receive_empty && default_change_output == 0)
        })
        .copied()
        .collect();

    let offchain_size: u64 = draft.outputs.iter().map(|o| o.script.offchain_payload).sum();
    let mandatory_fee = ctx.fees.offchain_fee(offchain_size);
    if *fee < mandatory_fee {
        *fee = mandatory_fee;
    }

    let missing = *fee
        + (change_count + echo_addresses.len()) as i64 * default_change_output
        - native_change;
    if missing > 0 {
        return Ok(BuildOutcome::NeedNative(missing));
    }

    let per_element = params.assets_per_element().max(1);
    let selected = draft.matrix.selected_coins();
    if selected.is_empty() {
        return Err(SelectionError::internal("no inputs selected"));
    }

    loop {
        let mut tx = Transaction::new();
        tx.outputs = draft.outputs.to_vec();
        let mut total_change_value = 0i64;
        let mut first_change_output: Option<usize> = None;

        for group in &active_groups {
            let assets = draft.change.group_assets(*group);
            let mut script = OutputScript::pay_to(draft.change_destination()?);
            for chunk in assets.chunks(per_element) {
                script = script.with_element(chunk.to_vec());
            }
            let value = draft.group_change_value(&script)?;
            total_change_value += value;
            first_change_output.get_or_insert(tx.outputs.len());
            tx.outputs.push(TxOut::new(value, script));
        }

        for address in &echo_addresses {
            total_change_value += default_change_output;
            tx.outputs
                .push(TxOut::new(default_change_output, OutputScript::pay_to(*address)));
        }

        if change_count > active_groups.len() {
            let amount = native_change - total_change_value - *fee;
            if amount < 0 {
                return Ok(BuildOutcome::NeedNative(-amount));
            }
            match first_change_output {
                Some(index) => tx.outputs[index].value += amount,
                None => tx
                    .outputs
                    .push(TxOut::new(amount, OutputScript::pay_to(draft.change_destination()?))),
            }
        }

        let mut weighted_inputs = 0f64;
        let mut signature_bytes = 0usize;
        for coin in &selected {
            let record = &draft.coins[*coin];
            tx.inputs.push(TxIn::new(record.outpoint));
            let age = if record.depth > 0 { record.depth + 1 } else { record.depth };
            weighted_inputs += record.value() as f64 * age as f64;
            signature_bytes += if record.output.script.is_pay_to_script() {
                ESTIMATED_SCRIPT_SIGNATURE_SIZE
            } else {
                ESTIMATED_SIGNATURE_SIZE
            };
        }

        if draft.sign {
            let witnesses = selected
                .iter()
                .enumerate()
                .map(|(i, coin)| ctx.signer.sign(&tx, i, &draft.coins[*coin].output.script))
                .collect::<SelectionResult<Vec<_>>>()?;
            for (input, witness) in tx.inputs.iter_mut().zip(witnesses) {
                input.sign(witness);
            }
            for index in 0..tx.inputs.len() {
                tx.verify_input(index)
                    .map_err(|e| SelectionError::Signing(format!("input {}: {}", index, e)))?;
            }
            signature_bytes = 0;
        }

        let size = tx.serialized_size()? + signature_bytes;
        if size >= params.max_standard_tx_size {
            return Err(SelectionError::TransactionTooLarge(format!(
                "{} bytes with {} inputs",
                size,
                tx.inputs.len()
            )));
        }

        let priority = compute_priority(weighted_inputs, size, tx.inputs.len());
        if ctx.wallet.send_free_transactions
            && size <= params.max_free_tx_create_size
            && ctx.fees.allow_free(priority)
        {
            debug!(size, priority, "free transaction");
            return Ok(BuildOutcome::Complete { tx, fee: *fee });
        }

        let fee_needed = ctx.fees.minimum_fee(size) + mandatory_fee;
        if fee_needed < ctx.fees.min_relay_fee(size) {
            return Err(SelectionError::TransactionTooLarge(
                "Transaction too large for fee policy".to_string(),
            ));
        }

        if *fee >= fee_needed {
            debug!(size, fee = *fee, inputs = tx.inputs.len(), outputs = tx.outputs.len(), "transaction built");
            return Ok(BuildOutcome::Complete { tx, fee: *fee });
        }

        debug!(old = *fee, new = fee_needed, size, "raising fee");
        *fee = fee_needed;
        let missing = *fee + total_change_value - native_change;
        if missing > 0 {
            return Ok(BuildOutcome::NeedNative(missing));
        }
    }
}
