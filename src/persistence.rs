//! Database persistence layer for the wallet

use crate::crypto::Address;
use crate::error::ChainError;
use crate::transaction::{OutPoint, TxId};
use crate::wallet::store::WalletTx;
use crate::wallet::unspent::UnspentIndex;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Abstraction for persistence backends. Implementations should provide
/// atomic saving/loading of wallet transactions and the unspent index.
pub trait Persistence: Send + Sync {
    fn save_wallet_tx(&self, wtx: &WalletTx) -> Result<(), ChainError>;
    fn load_wallet_txs(&self) -> Result<Vec<WalletTx>, ChainError>;
    fn erase_wallet_tx(&self, txid: &TxId) -> Result<(), ChainError>;
    fn save_spent(&self, outpoints: &[OutPoint]) -> Result<(), ChainError>;
    fn load_spent(&self) -> Result<Vec<OutPoint>, ChainError>;
    fn save_address(&self, address: &Address) -> Result<(), ChainError>;
    fn load_addresses(&self) -> Result<Vec<Address>, ChainError>;
    fn save_unspent_index(&self, index: &UnspentIndex) -> Result<(), ChainError>;
    fn load_unspent_index(&self) -> Result<UnspentIndex, ChainError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

fn to_hash(bytes: &[u8]) -> Result<[u8; 32], ChainError> {
    bytes
        .try_into()
        .map_err(|_| ChainError::DatabaseError(format!("Expected 32 byte key, found {}", bytes.len())))
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_txs (
                txid BLOB PRIMARY KEY,
                depth INTEGER NOT NULL,
                from_me INTEGER NOT NULL,
                tx_data TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create wallet_txs table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS spent_outputs (
                txid BLOB NOT NULL,
                output_index INTEGER NOT NULL,
                PRIMARY KEY (txid, output_index)
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create spent_outputs table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS addresses (
                address BLOB PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create addresses table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS unspent_index (
                txid BLOB PRIMARY KEY,
                unspent INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create unspent_index table: {}", e))
        })?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    pub fn save_wallet_tx(&self, wtx: &WalletTx) -> Result<(), ChainError> {
        let tx_json = serde_json::to_string(&wtx.tx).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to serialize transaction: {}", e))
        })?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO wallet_txs (txid, depth, from_me, tx_data) VALUES (?1, ?2, ?3, ?4)",
            params![wtx.txid().to_vec(), wtx.depth, wtx.from_me, tx_json],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save wallet transaction: {}", e)))?;

        Ok(())
    }

    pub fn load_wallet_txs(&self) -> Result<Vec<WalletTx>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT depth, from_me, tx_data FROM wallet_txs ORDER BY txid")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let depth: i32 = row.get(0)?;
                let from_me: bool = row.get(1)?;
                let tx_json: String = row.get(2)?;
                Ok((depth, from_me, tx_json))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query wallet transactions: {}", e)))?;

        let mut txs = Vec::new();
        for row_result in rows {
            let (depth, from_me, tx_json) = row_result
                .map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            let tx = serde_json::from_str(&tx_json).map_err(|e| {
                ChainError::DatabaseError(format!("Failed to deserialize transaction: {}", e))
            })?;
            txs.push(WalletTx::new(tx, depth, from_me));
        }

        Ok(txs)
    }

    pub fn erase_wallet_tx(&self, txid: &TxId) -> Result<(), ChainError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM wallet_txs WHERE txid = ?1", params![txid.to_vec()])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to erase wallet transaction: {}", e)))?;
        Ok(())
    }

    pub fn save_spent(&self, outpoints: &[OutPoint]) -> Result<(), ChainError> {
        let conn_guard = self.lock()?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        for outpoint in outpoints {
            tx.execute(
                "INSERT OR IGNORE INTO spent_outputs (txid, output_index) VALUES (?1, ?2)",
                params![outpoint.txid.to_vec(), outpoint.index],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save spent output: {}", e)))?;
        }

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(())
    }

    pub fn load_spent(&self) -> Result<Vec<OutPoint>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT txid, output_index FROM spent_outputs")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let txid: Vec<u8> = row.get(0)?;
                let index: u32 = row.get(1)?;
                Ok((txid, index))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query spent outputs: {}", e)))?;

        let mut spent = Vec::new();
        for row_result in rows {
            let (txid, index) = row_result
                .map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            spent.push(OutPoint::new(to_hash(&txid)?, index));
        }

        Ok(spent)
    }

    pub fn save_address(&self, address: &Address) -> Result<(), ChainError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO addresses (address) VALUES (?1)",
            params![address.to_vec()],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save address: {}", e)))?;
        Ok(())
    }

    pub fn load_addresses(&self) -> Result<Vec<Address>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT address FROM addresses ORDER BY address")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query addresses: {}", e)))?;

        let mut addresses = Vec::new();
        for row_result in rows {
            let bytes = row_result
                .map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            addresses.push(to_hash(&bytes)?);
        }

        Ok(addresses)
    }

    /// Replaces the stored index in one transaction.
    pub fn save_unspent_index(&self, index: &UnspentIndex) -> Result<(), ChainError> {
        let conn_guard = self.lock()?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        tx.execute("DELETE FROM unspent_index", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear unspent_index: {}", e)))?;

        for (txid, unspent) in index.iter() {
            tx.execute(
                "INSERT INTO unspent_index (txid, unspent) VALUES (?1, ?2)",
                params![txid.to_vec(), unspent],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save unspent count: {}", e)))?;
        }

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(())
    }

    pub fn load_unspent_index(&self) -> Result<UnspentIndex, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT txid, unspent FROM unspent_index")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let txid: Vec<u8> = row.get(0)?;
                let unspent: u32 = row.get(1)?;
                Ok((txid, unspent))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query unspent index: {}", e)))?;

        let mut index = UnspentIndex::new();
        for row_result in rows {
            let (txid, unspent) = row_result
                .map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            index.set(to_hash(&txid)?, unspent);
        }

        Ok(index)
    }
}

// Implement the Persistence trait for the rusqlite-backed Database
impl Persistence for Database {
    fn save_wallet_tx(&self, wtx: &WalletTx) -> Result<(), ChainError> {
        Database::save_wallet_tx(self, wtx)
    }

    fn load_wallet_txs(&self) -> Result<Vec<WalletTx>, ChainError> {
        Database::load_wallet_txs(self)
    }

    fn erase_wallet_tx(&self, txid: &TxId) -> Result<(), ChainError> {
        Database::erase_wallet_tx(self, txid)
    }

    fn save_spent(&self, outpoints: &[OutPoint]) -> Result<(), ChainError> {
        Database::save_spent(self, outpoints)
    }

    fn load_spent(&self) -> Result<Vec<OutPoint>, ChainError> {
        Database::load_spent(self)
    }

    fn save_address(&self, address: &Address) -> Result<(), ChainError> {
        Database::save_address(self, address)
    }

    fn load_addresses(&self) -> Result<Vec<Address>, ChainError> {
        Database::load_addresses(self)
    }

    fn save_unspent_index(&self, index: &UnspentIndex) -> Result<(), ChainError> {
        Database::save_unspent_index(self, index)
    }

    fn load_unspent_index(&self) -> Result<UnspentIndex, ChainError> {
        Database::load_unspent_index(self)
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub txs: Arc<Mutex<BTreeMap<TxId, WalletTx>>>,
    pub spent: Arc<Mutex<BTreeSet<OutPoint>>>,
    pub addresses: Arc<Mutex<BTreeSet<Address>>>,
    pub unspent: Arc<Mutex<UnspentIndex>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::DatabaseError("Mutex poisoned".to_string())
}

impl Persistence for InMemoryPersistence {
    fn save_wallet_tx(&self, wtx: &WalletTx) -> Result<(), ChainError> {
        let mut txs = self.txs.lock().map_err(poisoned)?;
        txs.insert(wtx.txid(), wtx.clone());
        Ok(())
    }

    fn load_wallet_txs(&self) -> Result<Vec<WalletTx>, ChainError> {
        let txs = self.txs.lock().map_err(poisoned)?;
        Ok(txs.values().cloned().collect())
    }

    fn erase_wallet_tx(&self, txid: &TxId) -> Result<(), ChainError> {
        let mut txs = self.txs.lock().map_err(poisoned)?;
        txs.remove(txid);
        Ok(())
    }

    fn save_spent(&self, outpoints: &[OutPoint]) -> Result<(), ChainError> {
        let mut spent = self.spent.lock().map_err(poisoned)?;
        spent.extend(outpoints.iter().copied());
        Ok(())
    }

    fn load_spent(&self) -> Result<Vec<OutPoint>, ChainError> {
        let spent = self.spent.lock().map_err(poisoned)?;
        Ok(spent.iter().copied().collect())
    }

    fn save_address(&self, address: &Address) -> Result<(), ChainError> {
        let mut addresses = self.addresses.lock().map_err(poisoned)?;
        addresses.insert(*address);
        Ok(())
    }

    fn load_addresses(&self) -> Result<Vec<Address>, ChainError> {
        let addresses = self.addresses.lock().map_err(poisoned)?;
        Ok(addresses.iter().copied().collect())
    }

    fn save_unspent_index(&self, index: &UnspentIndex) -> Result<(), ChainError> {
        let mut unspent = self.unspent.lock().map_err(poisoned)?;
        *unspent = index.clone();
        Ok(())
    }

    fn load_unspent_index(&self) -> Result<UnspentIndex, ChainError> {
        let unspent = self.unspent.lock().map_err(poisoned)?;
        Ok(unspent.clone())
    }
}
