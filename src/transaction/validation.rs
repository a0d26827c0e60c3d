//! Checks applied to requested outputs before any coin is selected

use crate::asset::AssetCatalog;
use crate::error::{SelectionError, SelectionResult};
use crate::permissions::{PermissionOracle, PermissionRole, Permissions};
use crate::script::ScriptKind;
use crate::transaction::types::TxOut;

/// Rejects outputs the wallet must not create: non-standard scripts,
/// recipients lacking receive permission, and issuance mixed with a
/// transfer in one output.
pub fn check_output_permissions(
    outputs: &[TxOut],
    oracle: &dyn PermissionOracle,
    catalog: &dyn AssetCatalog,
    anyone_can_receive_empty: bool,
    per_asset_permissions: bool,
) -> SelectionResult<()> {
    for (index, output) in outputs.iter().enumerate() {
        let script = &output.script;

        if output.value < 0 {
            return Err(SelectionError::InvalidParameter(format!(
                "Output {} has a negative value",
                index
            )));
        }
        if script.transfer_quantities().any(|q| q.quantity < 0) {
            return Err(SelectionError::InvalidParameter(format!(
                "Output {} has a negative asset quantity",
                index
            )));
        }

        if script.kind != ScriptKind::NullData && !script.is_standard() {
            return Err(SelectionError::NonStandardOutput(format!(
                "Output {} has a non-standard script",
                index
            )));
        }

        if script.issuance.is_some() && script.has_transfers() {
            return Err(SelectionError::InvalidParameter(format!(
                "Output {} both issues and transfers assets",
                index
            )));
        }

        let Some(destination) = script.destination else {
            continue;
        };

        let empty = output.value == 0 && !script.has_transfers() && script.issuance.is_none();
        let grant_only = empty && script.grant.is_some();
        if !grant_only
            && !oracle.can_receive(&destination)
            && !(anyone_can_receive_empty && empty)
        {
            return Err(SelectionError::InsufficientPermissions {
                role: PermissionRole::Receive,
                reason: format!("Output {}: destination doesn't have receive permission", index),
            });
        }

        if per_asset_permissions {
            for quantity in script.transfer_quantities() {
                if catalog
                    .restrictions(&quantity.asset)
                    .contains(Permissions::RECEIVE)
                    && !oracle.can_receive_asset(&destination, &quantity.asset)
                {
                    return Err(SelectionError::InsufficientPermissions {
                        role: PermissionRole::Receive,
                        reason: format!(
                            "Output {}: destination doesn't have receive permission for asset {}",
                            index,
                            hex::encode(&quantity.asset[..8])
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}
