//! AssetLedger - multi-asset coin selection for a permissioned UTXO ledger wallet
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Ledger Model
//! - [`asset`] - Asset keys, entities and the asset catalog
//! - [`permissions`] - Permission bits, roles and the permission oracle
//! - [`script`] - Output scripts and the coin parser
//! - [`transaction`] - Transaction types and output permission checks
//!
//! ## Coin Selection
//! - [`coinselect`] - Group tree, coin matrix, selector, change, fee iteration
//! - [`fees`] - Fee policy and priority
//! - [`cache`] - Parsed-coin LRU cache
//!
//! ## Cryptography
//! - [`crypto`] - Signer and key store (secp256k1)
//!
//! ## State Management
//! - [`wallet`] - Wallet store, unspent index, purge and auto-combine
//! - [`persistence`] - Database layer (SQLite)
//! - [`node`] - Wallet service and maintenance scheduling
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Ledger Model
// ============================================================================
pub mod asset;
pub mod permissions;
pub mod script;
pub mod transaction;

// ============================================================================
// Coin Selection
// ============================================================================
pub mod cache;
pub mod coinselect;
pub mod fees;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod node;
pub mod persistence;
pub mod wallet;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use coinselect::{BuildRequest, BuiltTransaction, EngineContext};
pub use error::{ChainError, SelectionError, SelectionResult};
pub use wallet::Wallet;
