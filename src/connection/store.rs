use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::ConnectionRecord;
use crate::error::{DbtflowError, ErrorCode, Result};

/// Environment variable prefix for connection records, `DBTFLOW_CONN_<ID>`
pub const CONN_ENV_PREFIX: &str = "DBTFLOW_CONN_";

/// Source of connection records, looked up by name
pub trait ConnectionStore: Send + Sync {
    /// Fetch a record, failing with `ConnectionNotFound` when absent
    fn get(&self, conn_id: &str) -> Result<ConnectionRecord>;

    /// Short label used in logs
    fn describe(&self) -> String;
}

/// In-memory store for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionStore {
    records: HashMap<String, ConnectionRecord>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ConnectionRecord) {
        if record.conn_id.is_empty() {
            tracing::warn!("Inserting connection record without conn_id");
        }
        self.records.insert(record.conn_id.clone(), record);
    }

    pub fn with(mut self, record: ConnectionRecord) -> Self {
        self.insert(record);
        self
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn get(&self, conn_id: &str) -> Result<ConnectionRecord> {
        self.records
            .get(conn_id)
            .cloned()
            .ok_or_else(|| DbtflowError::connection_not_found(conn_id))
    }

    fn describe(&self) -> String {
        format!("memory ({} records)", self.records.len())
    }
}

/// Records read from a YAML or JSON file keyed by connection id:
///
/// ```yaml
/// snowflake_default:
///   login: alice
///   password: secret
///   host: xy12345.snowflakecomputing.com
///   extra:
///     warehouse: TRANSFORM_WH
/// ```
#[derive(Debug, Clone)]
pub struct FileConnectionStore {
    path: PathBuf,
    records: BTreeMap<String, ConnectionRecord>,
}

impl FileConnectionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DbtflowError::config_with_code(
                ErrorCode::CONFIG_NOT_FOUND,
                "failed to read connections file",
            )
            .with_path(path)
            .with_source(e)
        })?;
        let store = Self::parse(&content).map_err(|e| e.with_path(path))?;
        tracing::debug!(
            "Loaded {} connection record(s) from {}",
            store.records.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            ..store
        })
    }

    /// Parse file contents; YAML is a superset of JSON so both are accepted
    pub fn parse(content: &str) -> Result<Self> {
        let mut records: BTreeMap<String, ConnectionRecord> = serde_yaml::from_str(content)
            .map_err(|e| {
                DbtflowError::config_with_code(ErrorCode::CONNECTION_INVALID, e.to_string())
            })?;
        for (conn_id, record) in records.iter_mut() {
            record.conn_id = conn_id.clone();
        }
        Ok(Self {
            path: PathBuf::new(),
            records,
        })
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }
}

impl ConnectionStore for FileConnectionStore {
    fn get(&self, conn_id: &str) -> Result<ConnectionRecord> {
        self.records
            .get(conn_id)
            .cloned()
            .ok_or_else(|| DbtflowError::connection_not_found(conn_id))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Records stored as JSON in `DBTFLOW_CONN_<UPPERCASE_ID>`
pub struct EnvConnectionStore {
    lookup: EnvLookup,
}

impl EnvConnectionStore {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    pub fn variable_name(conn_id: &str) -> String {
        format!("{}{}", CONN_ENV_PREFIX, conn_id.to_uppercase())
    }
}

impl Default for EnvConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStore for EnvConnectionStore {
    fn get(&self, conn_id: &str) -> Result<ConnectionRecord> {
        let var = Self::variable_name(conn_id);
        let raw = (self.lookup)(&var).ok_or_else(|| DbtflowError::connection_not_found(conn_id))?;

        let mut record: ConnectionRecord = serde_json::from_str(&raw).map_err(|e| {
            DbtflowError::config_with_code(
                ErrorCode::CONNECTION_INVALID,
                format!("{} does not hold a valid connection record", var),
            )
            .with_source(e)
        })?;
        record.conn_id = conn_id.to_string();
        Ok(record)
    }

    fn describe(&self) -> String {
        format!("env {}*", CONN_ENV_PREFIX)
    }
}

/// Tries each store in order; the first one holding the record wins. Errors
/// other than `ConnectionNotFound` stop the search.
#[derive(Default)]
pub struct ChainedConnectionStore {
    stores: Vec<Box<dyn ConnectionStore>>,
}

impl std::fmt::Debug for ChainedConnectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stores.iter().map(|store| store.describe()))
            .finish()
    }
}

impl ChainedConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, store: impl ConnectionStore + 'static) -> Self {
        self.stores.push(Box::new(store));
        self
    }
}

impl ConnectionStore for ChainedConnectionStore {
    fn get(&self, conn_id: &str) -> Result<ConnectionRecord> {
        for store in &self.stores {
            match store.get(conn_id) {
                Ok(record) => {
                    tracing::debug!("Connection '{}' found in {}", conn_id, store.describe());
                    return Ok(record);
                }
                Err(DbtflowError::ConnectionNotFound { .. }) => {
                    tracing::trace!("Connection '{}' not in {}", conn_id, store.describe());
                }
                Err(e) => return Err(e),
            }
        }
        Err(DbtflowError::connection_not_found(conn_id))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.stores.iter().map(|s| s.describe()).collect();
        format!("chain [{}]", parts.join(", "))
    }
}
