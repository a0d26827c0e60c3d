//! Configuration management for AssetLedger

use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainParams,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Chain-wide parameters the engine used to read from process globals.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainParams {
    #[serde(default = "default_target_spacing")]
    pub target_spacing_secs: i64,
    #[serde(default = "default_max_script_element_size")]
    pub max_script_element_size: usize,
    #[serde(default = "default_asset_ref_size")]
    pub asset_ref_size: usize,
    #[serde(default = "default_std_op_drop_count")]
    pub std_op_drop_count: usize,
    /// Value put on change and echo outputs; negative means dust based.
    #[serde(default)]
    pub minimum_per_output: i64,
    #[serde(default = "default_true")]
    pub anyone_can_receive_empty: bool,
    #[serde(default)]
    pub per_asset_permissions: bool,
    #[serde(default = "default_max_standard_tx_size")]
    pub max_standard_tx_size: usize,
    #[serde(default = "default_max_free_tx_create_size")]
    pub max_free_tx_create_size: usize,
    #[serde(default = "default_max_money")]
    pub max_money: i64,
    #[serde(default = "default_cent")]
    pub cent: i64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            target_spacing_secs: default_target_spacing(),
            max_script_element_size: default_max_script_element_size(),
            asset_ref_size: default_asset_ref_size(),
            std_op_drop_count: default_std_op_drop_count(),
            minimum_per_output: 0,
            anyone_can_receive_empty: true,
            per_asset_permissions: false,
            max_standard_tx_size: default_max_standard_tx_size(),
            max_free_tx_create_size: default_max_free_tx_create_size(),
            max_money: default_max_money(),
            cent: default_cent(),
        }
    }
}

impl ChainParams {
    /// How many asset quantities fit into one tagged script element.
    pub fn assets_per_element(&self) -> usize {
        self.max_script_element_size.saturating_sub(4) / (self.asset_ref_size + 8)
    }

    /// Upper bound for assets sharing one change output.
    pub fn max_assets_per_group(&self) -> usize {
        self.assets_per_element() * self.std_op_drop_count
    }

    /// `None` when change outputs are sized from the dust threshold.
    pub fn min_output(&self) -> Option<i64> {
        (self.minimum_per_output >= 0).then_some(self.minimum_per_output)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_true")]
    pub lock_inline_metadata: bool,
    #[serde(default = "default_true")]
    pub spend_zero_conf_change: bool,
    #[serde(default)]
    pub send_free_transactions: bool,
    #[serde(default = "default_autocombine_min_conf")]
    pub autocombine_min_conf: i32,
    #[serde(default = "default_autocombine_min_inputs")]
    pub autocombine_min_inputs: usize,
    #[serde(default = "default_autocombine_max_inputs")]
    pub autocombine_max_inputs: usize,
    #[serde(default = "default_autocombine_delay")]
    pub autocombine_delay_secs: i64,
    /// Zero derives the cap from the target block spacing.
    #[serde(default)]
    pub autocombine_max_txs: usize,
    #[serde(default = "default_cs_cache_size")]
    pub cs_cache_size: usize,
    #[serde(default = "default_purge_min_depth")]
    pub purge_min_depth: i32,
    #[serde(default = "default_purge_max_coins")]
    pub purge_max_coins: usize,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            lock_inline_metadata: true,
            spend_zero_conf_change: true,
            send_free_transactions: false,
            autocombine_min_conf: default_autocombine_min_conf(),
            autocombine_min_inputs: default_autocombine_min_inputs(),
            autocombine_max_inputs: default_autocombine_max_inputs(),
            autocombine_delay_secs: default_autocombine_delay(),
            autocombine_max_txs: 0,
            cs_cache_size: default_cs_cache_size(),
            purge_min_depth: default_purge_min_depth(),
            purge_max_coins: default_purge_max_coins(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_min_relay_fee")]
    pub min_relay_fee_per_kb: i64,
    #[serde(default = "default_min_relay_fee")]
    pub pay_tx_fee_per_kb: i64,
    #[serde(default = "default_free_priority_threshold")]
    pub free_priority_threshold: f64,
    #[serde(default)]
    pub offchain_fee_per_kb: i64,
    #[serde(default)]
    pub min_offchain_fee: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            min_relay_fee_per_kb: default_min_relay_fee(),
            pay_tx_fee_per_kb: default_min_relay_fee(),
            free_priority_threshold: default_free_priority_threshold(),
            offchain_fee_per_kb: 0,
            min_offchain_fee: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_wallet_db")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_wallet_db(),
        }
    }
}

/// Loads configuration from a TOML file, falling back to defaults when the
/// file is missing or empty.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.chain.max_script_element_size <= 4 {
        return Err("chain.max_script_element_size must be larger than 4".into());
    }
    if config.chain.assets_per_element() == 0 {
        return Err("chain.max_script_element_size cannot hold a single asset quantity".into());
    }
    if config.chain.std_op_drop_count == 0 {
        return Err("chain.std_op_drop_count must be positive".into());
    }
    if config.wallet.autocombine_min_inputs > config.wallet.autocombine_max_inputs {
        return Err("wallet.autocombine_min_inputs must not exceed autocombine_max_inputs".into());
    }
    if config.wallet.autocombine_max_inputs == 0 {
        return Err("wallet.autocombine_max_inputs must be positive".into());
    }
    if config.fees.min_relay_fee_per_kb < 0 || config.fees.pay_tx_fee_per_kb < 0 {
        return Err("fee rates must be non-negative".into());
    }
    if config.database.path.is_empty() {
        return Err("database.path must be set".into());
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_target_spacing() -> i64 {
    15
}

fn default_max_script_element_size() -> usize {
    520
}

fn default_asset_ref_size() -> usize {
    18
}

fn default_std_op_drop_count() -> usize {
    5
}

fn default_max_standard_tx_size() -> usize {
    100_000
}

fn default_max_free_tx_create_size() -> usize {
    1000
}

fn default_max_money() -> i64 {
    21_000_000 * 100_000_000
}

fn default_cent() -> i64 {
    1_000_000
}

fn default_autocombine_min_conf() -> i32 {
    1
}

fn default_autocombine_min_inputs() -> usize {
    50
}

fn default_autocombine_max_inputs() -> usize {
    100
}

fn default_autocombine_delay() -> i64 {
    1
}

fn default_cs_cache_size() -> usize {
    10_000
}

fn default_purge_min_depth() -> i32 {
    100
}

fn default_purge_max_coins() -> usize {
    1000
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_min_relay_fee() -> i64 {
    1000
}

fn default_free_priority_threshold() -> f64 {
    // one coin, a day old, in a 250 byte transaction
    100_000_000.0 * 144.0 / 250.0
}

fn default_wallet_db() -> String {
    "./data/wallet.db".to_string()
}
