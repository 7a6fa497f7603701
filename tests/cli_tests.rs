//! Integration tests for the CLI interface
//!
//! Every test passes an explicit config file so a config in the user's home
//! directory cannot leak in.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CONNECTIONS: &str = r#"
snowflake_default:
  conn_type: snowflake
  login: alice
  password: hunter2
  host: XY12345.snowflakecomputing.com
  extra:
    extra__snowflake__database: RAW
    warehouse: TRANSFORM_WH
no_database:
  login: bob
  password: pw
  extra:
    account: AB1
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("connections.yml"), CONNECTIONS).unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "query_tag = \"nightly\"\n\n[defaults]\nwarehouse = \"COMPUTE_WH\"\nrole = \"TRANSFORMER\"\nschema = \"ANALYTICS\"\n",
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("dbtflow").unwrap();
        cmd.arg("-c")
            .arg(self.path("config.toml"))
            .env_remove("RUST_LOG")
            .env_remove("DBTFLOW_CONNECTION_ID")
            .env_remove("DBTFLOW_CONN_SNOWFLAKE_DEFAULT")
            .env("DBTFLOW_LOCK_FILE", self.path("dbtflow.lock"));
        cmd
    }

    fn connections(&self) -> PathBuf {
        self.path("connections.yml")
    }
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_cli_help_lists_commands() {
    let mut cmd = Command::cargo_bin("dbtflow").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("env"))
        .stdout(predicate::str::contains("stages"));
}

#[test]
fn test_invalid_command() {
    let mut cmd = Command::cargo_bin("dbtflow").unwrap();
    cmd.arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_stages_prints_rendered_commands() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["stages", "--project-dir", "/work/my project", "--profiles-dir", "/work/profiles"])
        .args(["-t", "prod"])
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("$ dbt --version"))
        .stdout(predicate::str::contains(
            "$ dbt run --profiles-dir /work/profiles --project-dir '/work/my project' -t prod",
        ))
        .stdout(predicate::str::contains(
            "$ dbt deps --profiles-dir /work/profiles --project-dir '/work/my project'\n",
        ))
        .stdout(predicate::str::contains("end"));
}

#[test]
fn test_env_masks_password_by_default() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["env", "--connections-file", arg(&fixture.connections())])
        .assert()
        .success()
        .stdout(predicate::str::contains("SNOWFLAKE_ACCOUNT=XY12345"))
        .stdout(predicate::str::contains("SNOWFLAKE_USER=alice"))
        .stdout(predicate::str::contains("SNOWFLAKE_PASSWORD=***MASKED***"))
        .stdout(predicate::str::contains("SNOWFLAKE_DATABASE=RAW"))
        .stdout(predicate::str::contains("SNOWFLAKE_WAREHOUSE=TRANSFORM_WH"))
        .stdout(predicate::str::contains("SNOWFLAKE_ROLE=TRANSFORMER"))
        .stdout(predicate::str::contains("DBT_QUERY_TAG=nightly"))
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_env_show_secrets() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["env", "--show-secrets", "--connections-file", arg(&fixture.connections())])
        .assert()
        .success()
        .stdout(predicate::str::contains("SNOWFLAKE_PASSWORD=hunter2"));
}

#[test]
fn test_env_json_reports_sources() {
    let fixture = Fixture::new();
    let output = fixture
        .cmd()
        .args(["env", "--json", "--connections-file", arg(&fixture.connections())])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["SNOWFLAKE_ACCOUNT"]["value"], "XY12345");
    assert_eq!(json["SNOWFLAKE_ACCOUNT"]["source"], "derived from host");
    assert_eq!(json["SNOWFLAKE_SCHEMA"]["source"], "default");
    assert_eq!(json["SNOWFLAKE_PASSWORD"]["secret"], true);
    assert_eq!(json["SNOWFLAKE_PASSWORD"]["value"], "***MASKED***");
    assert!(json["PATH"]["value"].is_string());
}

#[test]
fn test_env_reads_connection_from_environment() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["env", "--connection", "ci"])
        .env(
            "DBTFLOW_CONN_CI",
            r#"{"login": "ci-bot", "password": "x", "extra": "{\"account\": \"CI1\", \"database\": \"CI_DB\"}"}"#,
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("SNOWFLAKE_ACCOUNT=CI1"))
        .stdout(predicate::str::contains("SNOWFLAKE_USER=ci-bot"));
}

#[test]
fn test_unknown_connection_fails() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["env", "--connection", "nope"])
        .args(["--connections-file", arg(&fixture.connections())])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Connection 'nope' was not found"));
}

#[test]
fn test_missing_required_field_fails() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["run", "--connection", "no_database"])
        .args(["--connections-file", arg(&fixture.connections())])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("'database'"));
}

#[test]
fn test_missing_config_file_fails() {
    let mut cmd = Command::cargo_bin("dbtflow").unwrap();
    cmd.args(["-c", "/nonexistent/dbtflow.toml", "stages"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_invalid_policy_rejected() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["run", "--policy", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown run policy"));
}
