use crate::asset::AssetCatalog;
use crate::coinselect::orchestrator::{BuildRequest, BuiltTransaction};
use crate::coinselect::EngineContext;
use crate::config::Config;
use crate::crypto::Signer;
use crate::error::SelectionResult;
use crate::fees::FeePolicy;
use crate::permissions::PermissionOracle;
use crate::persistence::{Database, InMemoryPersistence, Persistence};
use crate::wallet::store::MemoryWalletStore;
use crate::wallet::Wallet;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber, filtered by `RUST_LOG` (default
/// `info`). Later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub combined: usize,
    pub purged: usize,
}

/// A wallet behind the coarse lock shared by user builds and the
/// maintenance job.
pub struct WalletService {
    pub config: Config,
    pub ctx: EngineContext,
    pub wallet: Arc<Mutex<Wallet>>,
    pub state: Arc<RwLock<ServiceState>>,
}

impl WalletService {
    /// Opens the wallet database named by the config, falling back to
    /// in-memory persistence when it cannot be opened.
    pub fn open(
        config: Config,
        oracle: Arc<dyn PermissionOracle>,
        catalog: Arc<dyn AssetCatalog>,
        fees: Arc<dyn FeePolicy>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let db_path = std::path::Path::new(&config.database.path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create data dir {:?}: {}", parent, e))?;
            }
        }

        let persistence: Box<dyn Persistence> = match Database::open(&config.database.path) {
            Ok(db) => Box::new(db),
            Err(e) => {
                warn!(
                    "Failed to open DB at {}: {}. Falling back to in-memory persistence.",
                    config.database.path, e
                );
                Box::new(InMemoryPersistence::new())
            }
        };

        let ctx = EngineContext::new(&config, oracle, catalog, fees, signer);
        let store = MemoryWalletStore::open(persistence)?;
        let service = Self::with_store(config, ctx, store)?;
        info!(path = %service.config.database.path, "wallet service ready");
        Ok(service)
    }

    pub fn with_store(config: Config, ctx: EngineContext, store: MemoryWalletStore) -> SelectionResult<Self> {
        let mut wallet = Wallet::new(&ctx, store)?;
        wallet.initialize_unspent_index(&ctx)?;
        Ok(Self {
            config,
            ctx,
            wallet: Arc::new(Mutex::new(wallet)),
            state: Arc::new(RwLock::new(ServiceState::Ready)),
        })
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn build_transaction(&self, request: &BuildRequest) -> SelectionResult<BuiltTransaction> {
        self.wallet.lock().build_transaction(&self.ctx, request)
    }

    pub fn send(&self, request: &BuildRequest) -> SelectionResult<BuiltTransaction> {
        self.wallet.lock().send(&self.ctx, request)
    }

    /// One round of auto-combine followed by a purge of spent records.
    pub fn run_maintenance(&self) -> SelectionResult<MaintenanceReport> {
        let mut wallet = self.wallet.lock();
        let combined = wallet.optimize_unspent(&self.ctx)?;
        let purged = wallet.purge_spent_coins(
            self.config.wallet.purge_min_depth,
            self.config.wallet.purge_max_coins,
        )?;
        Ok(MaintenanceReport { combined, purged })
    }

    /// Runs [`run_maintenance`](Self::run_maintenance) every
    /// `maintenance_interval_secs` until the handle is aborted.
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.wallet.maintenance_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let service = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || service.run_maintenance()).await {
                    Ok(Ok(report)) => {
                        if report.combined > 0 || report.purged > 0 {
                            info!(combined = report.combined, purged = report.purged, "wallet maintenance");
                        }
                        *self.state.write() = ServiceState::Ready;
                    }
                    Ok(Err(e)) => {
                        warn!("Wallet maintenance failed: {}", e);
                        *self.state.write() = ServiceState::Degraded;
                    }
                    Err(e) => {
                        error!("Wallet maintenance task panicked: {}", e);
                        *self.state.write() = ServiceState::Degraded;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetRegistry;
    use crate::crypto::KeyStore;
    use crate::fees::StandardFeePolicy;
    use crate::permissions::PermissionTable;
    use tempfile::TempDir;

    fn open_in(dir: &TempDir) -> WalletService {
        let mut config = Config::default();
        config.database.path = dir.path().join("data").join("wallet.db").to_string_lossy().into_owned();
        WalletService::open(
            config,
            Arc::new(PermissionTable::new()),
            Arc::new(AssetRegistry::new()),
            Arc::new(StandardFeePolicy::default()),
            Arc::new(KeyStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_open_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        let service = open_in(&dir);
        assert!(dir.path().join("data").join("wallet.db").exists());
        assert_eq!(service.state(), ServiceState::Ready);
        assert_eq!(service.run_maintenance().unwrap(), MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_maintenance_task_runs() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(open_in(&dir));
        let handle = Arc::clone(&service).spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert_eq!(service.state(), ServiceState::Ready);
    }
}
