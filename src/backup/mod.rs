pub(crate) mod db_dump; // Shared subprocess and artifact-path helpers
mod mongo;
mod mysql;
mod postgres;
mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::{ExecutionError, UnsupportedTypeError};
use crate::model::{BackupRequest, DatabaseType};

pub use db_dump::DumpTool;
pub use mongo::MongoDump;
pub use mysql::MySqlDump;
pub use postgres::PostgresDump;
pub use redis::RedisDump;

/// One way of turning a backup request into exactly one artifact file.
#[async_trait]
pub trait DumpStrategy: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Runs the dump and returns the path of the produced artifact.
    async fn run(&self, request: &BackupRequest) -> Result<PathBuf, ExecutionError>;
}

/// Lookup table from type tag to dump strategy.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<DatabaseType, Arc<dyn DumpStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock client tools, writing artifacts under `output_root`.
    pub fn with_defaults(output_root: impl Into<PathBuf>) -> Self {
        let root = output_root.into();
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresDump::with_defaults(&root)));
        registry.register(Arc::new(MySqlDump::with_defaults(&root)));
        registry.register(Arc::new(MongoDump::with_defaults(&root)));
        registry.register(Arc::new(RedisDump::with_defaults(&root)));
        registry
    }

    /// Registers a strategy under its own type, returning any strategy it replaced.
    pub fn register(&mut self, strategy: Arc<dyn DumpStrategy>) -> Option<Arc<dyn DumpStrategy>> {
        self.strategies.insert(strategy.database_type(), strategy)
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn DumpStrategy>, UnsupportedTypeError> {
        let db_type: DatabaseType = tag.parse()?;
        self.strategies
            .get(&db_type)
            .cloned()
            .ok_or_else(|| UnsupportedTypeError(tag.to_string()))
    }

    pub fn supported(&self) -> Vec<DatabaseType> {
        DatabaseType::ALL
            .into_iter()
            .filter(|t| self.strategies.contains_key(t))
            .collect()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("supported", &self.supported())
            .finish()
    }
}
