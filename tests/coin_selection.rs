//! Integration tests for transaction building and consolidation

use assetledger::asset::{AssetEntity, AssetKey, AssetRegistry};
use assetledger::coinselect::{BuildRequest, EngineContext};
use assetledger::config::Config;
use assetledger::crypto::{address_from_string, Address, KeyPair, KeyStore};
use assetledger::error::{SelectionError, INLINE_METADATA_NOTE, NO_SEND_COINS_REASON};
use assetledger::fees::StandardFeePolicy;
use assetledger::permissions::{PermissionRole, PermissionTable, Permissions};
use assetledger::persistence::InMemoryPersistence;
use assetledger::script::OutputScript;
use assetledger::transaction::{OutPoint, Transaction, TxId, TxOut};
use assetledger::wallet::store::{MemoryWalletStore, WalletStore, WalletTx};
use assetledger::wallet::Wallet;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Fixture {
    ctx: EngineContext,
    wallet: Wallet,
    permissions: Arc<PermissionTable>,
    registry: Arc<AssetRegistry>,
    keys: Arc<KeyStore>,
    nonce: u32,
}

impl Fixture {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let permissions = Arc::new(PermissionTable::new());
        let registry = Arc::new(AssetRegistry::new());
        let keys = Arc::new(KeyStore::new());
        let ctx = EngineContext::new(
            &config,
            permissions.clone(),
            registry.clone(),
            Arc::new(StandardFeePolicy::from_config(&config.fees)),
            keys.clone(),
        );
        let store = MemoryWalletStore::new(Box::new(InMemoryPersistence::new()));
        let wallet = Wallet::new(&ctx, store)?;
        Ok(Self {
            ctx,
            wallet,
            permissions,
            registry,
            keys,
            nonce: 0,
        })
    }

    /// New wallet address holding `permissions`.
    fn address(&mut self, permissions: Permissions) -> Result<Address, Box<dyn std::error::Error>> {
        let address = self.keys.insert(KeyPair::generate()?);
        self.permissions.grant(address, permissions);
        self.wallet.store_mut().add_address(address)?;
        Ok(address)
    }

    /// Receives one transaction paying `outputs` at the given depth.
    fn receive(&mut self, outputs: Vec<TxOut>, depth: i32) -> Result<TxId, Box<dyn std::error::Error>> {
        self.nonce += 1;
        let mut tx = Transaction::new();
        tx.lock_time = self.nonce;
        tx.outputs = outputs;
        let txid = self
            .wallet
            .store_mut()
            .add_transaction(WalletTx::new(tx, depth, false))?;
        self.wallet.update_unspent_index(&self.ctx, &txid)?;
        Ok(txid)
    }

    fn native_inputs(&self, inputs: &[OutPoint]) -> i64 {
        inputs
            .iter()
            .filter_map(|o| {
                let wtx = self.wallet.store().transaction(&o.txid)?;
                wtx.tx.outputs.get(o.index as usize).map(|out| out.value)
            })
            .sum()
    }

    fn asset_inputs(&self, inputs: &[OutPoint]) -> BTreeMap<[u8; 32], i64> {
        let mut totals = BTreeMap::new();
        for outpoint in inputs {
            if let Some(wtx) = self.wallet.store().transaction(&outpoint.txid) {
                if let Some(output) = wtx.tx.outputs.get(outpoint.index as usize) {
                    for quantity in output.script.transfer_quantities() {
                        *totals.entry(quantity.asset).or_insert(0) += quantity.quantity;
                    }
                }
            }
        }
        totals
    }
}

#[test]
fn test_asset_send_with_single_coin() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);

    fx.receive(
        vec![TxOut::new(1_000_000, OutputScript::pay_to(alice).with_transfer(gold, 50))],
        10,
    )?;

    let request = BuildRequest::send(vec![TxOut::new(0, OutputScript::pay_to(bob).with_transfer(gold, 30))]);
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    let tx = &built.transaction;

    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.outputs.len(), 2);
    assert!(tx.is_signed());
    assert_eq!(built.change_address, Some(alice));

    let change = &tx.outputs[1];
    assert_eq!(change.script.destination, Some(alice));
    assert_eq!(change.amounts().get(&AssetKey::Entity(gold)), Some(&20));
    assert!(built.fee > 0);
    assert_eq!(change.value, 1_000_000 - built.fee);
    Ok(())
}

#[test]
fn test_asset_send_from_small_native_coin() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.fees.min_relay_fee_per_kb = 50;
    config.fees.pay_tx_fee_per_kb = 50;
    let mut fx = Fixture::with_config(config)?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);

    let funded = fx.receive(
        vec![TxOut::new(100, OutputScript::pay_to(alice).with_transfer(gold, 50))],
        10,
    )?;

    let request = BuildRequest::send(vec![TxOut::new(0, OutputScript::pay_to(bob).with_transfer(gold, 30))]);
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    let tx = &built.transaction;

    assert_eq!(built.inputs, vec![OutPoint::new(funded, 0)]);
    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.outputs[0].amounts().get(&AssetKey::Entity(gold)), Some(&30));

    let change = &tx.outputs[1];
    assert_eq!(change.script.destination, Some(alice));
    assert_eq!(change.amounts().get(&AssetKey::Entity(gold)), Some(&20));
    assert!(built.fee > 0 && built.fee < 100);
    assert_eq!(change.value, 100 - built.fee);
    Ok(())
}

#[test]
fn test_native_short_of_fee_fails_without_spending() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);
    fx.receive(
        vec![
            TxOut::new(60_000, OutputScript::pay_to(alice)),
            TxOut::new(40_000, OutputScript::pay_to(alice)),
        ],
        10,
    )?;
    let index_before = fx.wallet.unspent_index().clone();

    let request = BuildRequest::send(vec![TxOut::new(100_000, OutputScript::pay_to(bob))]);
    let err = fx.wallet.send(&fx.ctx, &request).unwrap_err();
    assert!(matches!(err, SelectionError::InsufficientFunds(_)), "unexpected error {:?}", err);

    assert_eq!(fx.wallet.store().len(), 1);
    assert_eq!(fx.wallet.unspent_index(), &index_before);
    let coins = fx.wallet.store().available_coins(&Default::default());
    assert_eq!(coins.len(), 2);
    assert!(coins.iter().all(|c| !fx.wallet.store().is_spent(&c.outpoint)));

    // the same wallet can still pay an amount that leaves room for the fee
    let request = BuildRequest::send(vec![TxOut::new(90_000, OutputScript::pay_to(bob))]);
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    assert_eq!(built.inputs.len(), 2);
    Ok(())
}

#[test]
fn test_inline_metadata_coins_locked() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);

    let tagged = fx.receive(
        vec![TxOut::new(
            50_000,
            OutputScript::pay_to(alice).with_transfer(gold, 50).with_inline_metadata(),
        )],
        10,
    )?;
    fx.receive(vec![TxOut::new(1_000_000, OutputScript::pay_to(alice))], 10)?;

    let request = BuildRequest::send(vec![TxOut::new(0, OutputScript::pay_to(bob).with_transfer(gold, 30))]);
    let err = fx.wallet.build_transaction(&fx.ctx, &request).unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientFunds(_) | SelectionError::NoUnspentOutputs(_)
    ));
    assert!(err.to_string().contains(INLINE_METADATA_NOTE));

    fx.ctx.wallet.lock_inline_metadata = false;
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    assert!(built.inputs.contains(&OutPoint::new(tagged, 0)));
    Ok(())
}

#[test]
fn test_build_conserves_value_and_assets() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let silver = fx.registry.register(AssetEntity::asset("silver"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);

    fx.receive(vec![TxOut::new(40_000, OutputScript::pay_to(alice).with_transfer(gold, 7))], 3)?;
    fx.receive(vec![TxOut::new(60_000, OutputScript::pay_to(alice).with_transfer(silver, 9))], 4)?;
    fx.receive(
        vec![
            TxOut::new(500_000, OutputScript::pay_to(alice)),
            TxOut::new(250_000, OutputScript::pay_to(alice)),
        ],
        8,
    )?;

    let request = BuildRequest::send(vec![
        TxOut::new(300_000, OutputScript::pay_to(bob).with_transfer(gold, 5)),
        TxOut::new(0, OutputScript::pay_to(bob).with_transfer(silver, 9)),
    ]);
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    let tx = &built.transaction;

    assert_eq!(fx.native_inputs(&built.inputs), tx.total_output_value() + built.fee);
    assert_eq!(fx.asset_inputs(&built.inputs), tx.asset_totals());
    assert!(built.fee > 0);

    let mut unique = built.inputs.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), built.inputs.len());
    Ok(())
}

#[test]
fn test_asset_missing_from_native_only_wallet() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);
    fx.receive(vec![TxOut::new(1_000_000, OutputScript::pay_to(alice))], 10)?;

    let request = BuildRequest::send(vec![TxOut::new(0, OutputScript::pay_to(bob).with_transfer(gold, 1))]);
    let err = fx.wallet.build_transaction(&fx.ctx, &request).unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientFunds(_) | SelectionError::NoUnspentOutputs(_)
    ));
    Ok(())
}

#[test]
fn test_coins_without_send_permission_reported() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let ruby = fx.registry.register(AssetEntity::asset("ruby"));
    let carol = fx.address(Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);
    fx.receive(vec![TxOut::new(0, OutputScript::pay_to(carol).with_transfer(ruby, 10))], 10)?;

    let request = BuildRequest::send(vec![TxOut::new(0, OutputScript::pay_to(bob).with_transfer(ruby, 5))]);
    match fx.wallet.build_transaction(&fx.ctx, &request) {
        Err(SelectionError::InsufficientPermissions { role, reason }) => {
            assert_eq!(role, PermissionRole::Send);
            assert!(reason.starts_with(NO_SEND_COINS_REASON));
        }
        other => panic!("unexpected result {:?}", other),
    }
    Ok(())
}

#[test]
fn test_recipient_without_receive_permission() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    fx.receive(vec![TxOut::new(1_000_000, OutputScript::pay_to(alice))], 10)?;

    let request = BuildRequest::send(vec![TxOut::new(5_000, OutputScript::pay_to(address_from_string("dave")))]);
    let err = fx.wallet.build_transaction(&fx.ctx, &request).unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientPermissions {
            role: PermissionRole::Receive,
            ..
        }
    ));
    Ok(())
}

#[test]
fn test_single_source_without_issue_permission() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);
    fx.receive(vec![TxOut::new(1_000_000, OutputScript::pay_to(alice))], 10)?;

    let request = BuildRequest::send(vec![TxOut::new(0, OutputScript::pay_to(bob).with_follow_on(gold, 100))])
        .from_addresses([alice]);
    let err = fx.wallet.build_transaction(&fx.ctx, &request).unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientPermissions {
            role: PermissionRole::Issue,
            ..
        }
    ));
    Ok(())
}

#[test]
fn test_must_use_coins() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);
    fx.receive(vec![TxOut::new(2_000_000, OutputScript::pay_to(alice))], 10)?;
    let small = fx.receive(vec![TxOut::new(30_000, OutputScript::pay_to(alice))], 10)?;

    let outputs = vec![TxOut::new(100_000, OutputScript::pay_to(bob))];
    let forced = OutPoint::new(small, 0);
    let request = BuildRequest::send(outputs.clone()).with_must_use(vec![forced]);
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    assert!(built.inputs.contains(&forced));

    let unknown = OutPoint::new([0xee; 32], 0);
    let request = BuildRequest::send(outputs).with_must_use(vec![unknown]);
    let err = fx.wallet.build_transaction(&fx.ctx, &request).unwrap_err();
    assert!(matches!(err, SelectionError::PreselectedCoinNotFound(o) if o == unknown));
    Ok(())
}

#[test]
fn test_unsigned_build_leaves_inputs_empty() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let bob = address_from_string("bob");
    fx.permissions.grant(bob, Permissions::RECEIVE);
    fx.receive(vec![TxOut::new(1_000_000, OutputScript::pay_to(alice))], 10)?;

    let request = BuildRequest::send(vec![TxOut::new(100_000, OutputScript::pay_to(bob))]).unsigned();
    let built = fx.wallet.build_transaction(&fx.ctx, &request)?;
    assert!(built.transaction.inputs.iter().all(|i| i.witness.is_none()));
    assert_eq!(fx.native_inputs(&built.inputs), built.transaction.total_output_value() + built.fee);
    Ok(())
}

#[test]
fn test_combine_with_too_few_coins() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;
    let outputs = (0..10)
        .map(|_| TxOut::new(100_000, OutputScript::pay_to(alice)))
        .collect();
    fx.receive(outputs, 5)?;

    let request = BuildRequest::combine(alice, 1, 50, 100);
    let err = fx.wallet.build_transaction(&fx.ctx, &request).unwrap_err();
    assert!(matches!(err, SelectionError::NotEnoughInputs { found: 10, required: 50 }));
    assert_eq!(fx.wallet.store().len(), 1);
    Ok(())
}

#[test]
fn test_auto_combine_keeps_asset_set() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = Fixture::new()?;
    let gold = fx.registry.register(AssetEntity::asset("gold"));
    let alice = fx.address(Permissions::SEND | Permissions::RECEIVE)?;

    let native: Vec<TxOut> = (0..60)
        .map(|_| TxOut::new(100_000, OutputScript::pay_to(alice)))
        .collect();
    fx.receive(native, 5)?;
    let gold_coins: Vec<TxOut> = (0..3)
        .map(|_| TxOut::new(1_000, OutputScript::pay_to(alice).with_transfer(gold, 5)))
        .collect();
    fx.receive(gold_coins, 5)?;

    assert_eq!(fx.wallet.optimize_unspent_at(&fx.ctx, 1_000)?, 1);

    let coins = fx.wallet.store().available_coins(&Default::default());
    assert_eq!(coins.len(), 1);
    let merged = &coins[0].output;
    assert_eq!(merged.script.destination, Some(alice));
    let assets: Vec<_> = merged.script.transfer_quantities().map(|q| (q.asset, q.quantity)).collect();
    assert_eq!(assets, vec![(gold, 15)]);
    assert!(merged.value > 6_000_000 - 100_000 && merged.value < 6_003_000);
    Ok(())
}
