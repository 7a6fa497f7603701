//! Lookup → resolve → orchestrate.
//!
//! Configuration-time failures (unknown connection, missing field, bad
//! config) surface here before any stage has started.

use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::connection::{
    ChainedConnectionStore, ConnectionStore, EnvConnectionStore, FileConnectionStore,
};
use crate::error::Result;
use crate::pipeline::{CancelToken, Pipeline, PipelineOrchestrator, PipelinePaths, RunReport};
use crate::resolver::{ConfigResolver, ResolvedEnvironment};
use crate::subprocess::SubprocessManager;

/// Environment records first, then the configured connections file
pub fn default_store(config: &PipelineConfig) -> Result<ChainedConnectionStore> {
    let mut store = ChainedConnectionStore::new().push(EnvConnectionStore::new());
    if let Some(path) = &config.connections_file {
        store = store.push(FileConnectionStore::open(path)?);
    }
    debug!("Connection store: {}", store.describe());
    Ok(store)
}

pub fn resolve_environment(
    config: &PipelineConfig,
    store: &dyn ConnectionStore,
) -> Result<ResolvedEnvironment> {
    let record = store.get(&config.connection_id)?;
    debug!("Found connection '{}' in {}", record.conn_id, store.describe());

    let env = ConfigResolver::from_config(config).resolve(&record)?;
    debug!("Resolved environment: {:?}", env);
    Ok(env)
}

/// Run the standard dbt pipeline against the configured connection
pub async fn run_pipeline(
    config: &PipelineConfig,
    store: &dyn ConnectionStore,
    subprocess: SubprocessManager,
    cancel: CancelToken,
) -> Result<RunReport> {
    let pipeline = Pipeline::dbt(config)?;
    let paths = PipelinePaths::from_config(config)?;
    let env = resolve_environment(config, store)?;

    info!(
        "Resolved {} variables from connection '{}'",
        env.len(),
        config.connection_id
    );

    PipelineOrchestrator::from_config(subprocess, config)
        .execute(&pipeline, &env, &paths, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::RunPolicy;
    use crate::connection::{ConnectionRecord, MemoryConnectionStore};
    use crate::error::DbtflowError;
    use crate::pipeline::StageState;

    fn store() -> MemoryConnectionStore {
        MemoryConnectionStore::new().with(
            ConnectionRecord::new("snowflake_default")
                .with_login("alice")
                .with_password("hunter2")
                .with_host("XY12345.snowflakecomputing.com")
                .with_extra("warehouse", "TRANSFORM_WH")
                .with_extra("extra__snowflake__database", "RAW")
                .with_extra("role", "TRANSFORMER")
                .with_extra("schema", "PUBLIC"),
        )
    }

    /// Lock file kept inside `dir` so parallel tests never share one
    fn config(dir: &TempDir, policy: RunPolicy) -> PipelineConfig {
        PipelineConfig {
            run_policy: policy,
            lock_file: Some(dir.path().join("dbtflow.lock")),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_resolve_environment_from_store() {
        let env = resolve_environment(&PipelineConfig::default(), &store()).unwrap();
        assert_eq!(env.get("SNOWFLAKE_ACCOUNT"), Some("XY12345"));
        assert_eq!(env.get("SNOWFLAKE_DATABASE"), Some("RAW"));
    }

    #[test]
    fn test_default_store_reports_bad_connections_file() {
        let config = PipelineConfig {
            connections_file: Some("/nonexistent/connections.yml".into()),
            ..PipelineConfig::default()
        };
        let err = default_store(&config).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_run_pipeline_executes_all_dbt_stages() {
        let dir = TempDir::new().unwrap();
        let (manager, mut mock) = SubprocessManager::mock();
        mock.expect_command("dbt").returns_success().finish();

        let report = run_pipeline(
            &config(&dir, RunPolicy::Reject),
            &store(),
            manager,
            CancelToken::never(),
        )
        .await
        .unwrap();

        assert!(report.succeeded());
        assert!(report
            .stages
            .iter()
            .all(|stage| stage.state == StageState::Succeeded));

        let first_args: Vec<String> = mock
            .get_call_history()
            .into_iter()
            .map(|c| c.args.first().cloned().unwrap_or_default())
            .collect();
        assert_eq!(first_args, vec!["--version", "debug", "deps", "run", "test"]);
        assert!(mock
            .get_call_history()
            .iter()
            .all(|c| c.env.get("SNOWFLAKE_USER").map(String::as_str) == Some("alice")));
        assert!(!dir.path().join("dbtflow.lock").exists());
    }

    #[tokio::test]
    async fn test_separate_run_pipeline_calls_share_one_run_slot() {
        let dir = TempDir::new().unwrap();
        let (manager, mut mock) = SubprocessManager::mock();
        mock.expect_command("dbt")
            .with_delay(Duration::from_millis(100))
            .finish();

        let config = config(&dir, RunPolicy::Reject);
        let store = store();
        let first = run_pipeline(&config, &store, manager.clone(), CancelToken::never());
        let second = async {
            while mock.get_call_history().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            run_pipeline(&config, &store, manager.clone(), CancelToken::never()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.unwrap().succeeded());
        assert!(matches!(second, Err(DbtflowError::RunInProgress { .. })));
        assert_eq!(mock.max_concurrent(), 1);
        assert_eq!(mock.get_call_history().len(), 5);
    }

    #[tokio::test]
    async fn test_queued_run_pipeline_calls_never_overlap() {
        let dir = TempDir::new().unwrap();
        let (manager, mut mock) = SubprocessManager::mock();
        mock.expect_command("dbt")
            .with_delay(Duration::from_millis(20))
            .finish();

        let config = config(&dir, RunPolicy::Queue);
        let store = store();
        let (first, second) = tokio::join!(
            run_pipeline(&config, &store, manager.clone(), CancelToken::never()),
            run_pipeline(&config, &store, manager.clone(), CancelToken::never())
        );

        assert!(first.unwrap().succeeded());
        assert!(second.unwrap().succeeded());
        assert_eq!(mock.max_concurrent(), 1);
        assert_eq!(mock.get_call_history().len(), 10);
    }

    #[tokio::test]
    async fn test_unknown_connection_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let (manager, mock) = SubprocessManager::mock();
        let config = PipelineConfig {
            connection_id: "missing".to_string(),
            ..config(&dir, RunPolicy::Reject)
        };

        let err = run_pipeline(&config, &store(), manager, CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DbtflowError::ConnectionNotFound { ref conn_id } if conn_id == "missing"));
        assert!(mock.get_call_history().is_empty());
    }

    #[tokio::test]
    async fn test_missing_field_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let (manager, mock) = SubprocessManager::mock();
        let store = MemoryConnectionStore::new()
            .with(ConnectionRecord::new("snowflake_default").with_login("alice"));

        let err = run_pipeline(
            &config(&dir, RunPolicy::Reject),
            &store,
            manager,
            CancelToken::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbtflowError::MissingRequiredField { .. }));
        assert!(mock.get_call_history().is_empty());
    }
}
