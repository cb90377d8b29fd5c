//! Per-run resources handed to every step: configuration, the HTTP port and
//! a factory for scoped store connections.

use crate::app::ports::HttpClientPort;
use crate::config::Config;
use crate::error::Result;
use crate::infra::http_client::ReqwestHttp;
use crate::pipeline::storage::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opens a fresh connection per step. Connections are never shared between
/// steps or held across an await point.
#[derive(Debug, Clone)]
pub struct StoreFactory {
    db_path: PathBuf,
}

impl StoreFactory {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a connection with every table created.
    pub fn open(&self) -> Result<Store> {
        Store::open(&self.db_path)
    }

    /// Run `f` against a connection on the blocking pool; the connection is
    /// closed when `f` returns.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Store) -> Result<T> + Send + 'static,
    {
        let factory = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut store = factory.open()?;
            f(&mut store)
        })
        .await?
    }
}

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub http: Arc<dyn HttpClientPort>,
    pub stores: StoreFactory,
}

impl PipelineContext {
    pub fn new(config: Config, http: Arc<dyn HttpClientPort>) -> Self {
        let stores = StoreFactory::new(config.paths.db_path());
        Self {
            config: Arc::new(config),
            http,
            stores,
        }
    }

    /// Context backed by the real reqwest client.
    pub fn from_config(config: Config) -> Result<Self> {
        let http = ReqwestHttp::new(&config.http)?;
        Ok(Self::new(config, Arc::new(http)))
    }
}
