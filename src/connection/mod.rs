//! Connection records and the stores that hand them out.
//!
//! A record mirrors the usual orchestrator connection layout: a handful of
//! first-class attributes plus a free-form `extra` blob. Fields the resolver
//! needs may live in either place.

mod store;

pub use store::{
    ChainedConnectionStore, ConnectionStore, EnvConnectionStore, FileConnectionStore,
    MemoryConnectionStore, CONN_ENV_PREFIX,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// First-class attributes of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseFields {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conn_id: String,
    #[serde(default)]
    pub conn_type: Option<String>,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(flatten)]
    pub base: BaseFields,
    #[serde(default, alias = "extra", deserialize_with = "deserialize_extras")]
    pub extras: Map<String, Value>,
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("conn_id", &self.conn_id)
            .field("conn_type", &self.conn_type)
            .field("login", &self.login)
            .field("password", &"***")
            .field("base", &self.base)
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Accept extras either as a JSON object or as a string holding one
fn deserialize_extras<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(&s).map_err(D::Error::custom)? {
            Value::Object(map) => Ok(map),
            _ => Err(D::Error::custom("extras string must contain a JSON object")),
        },
        _ => Err(D::Error::custom("extras must be an object")),
    }
}

/// Render an extras value as a plain string. Strings pass through, numbers and
/// booleans use their JSON text; null and containers count as absent.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl ConnectionRecord {
    pub fn new(conn_id: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            ..Self::default()
        }
    }

    pub fn with_login(mut self, login: impl Into<String>) -> Self {
        self.login = login.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.base.host = Some(host.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.base.schema = Some(schema.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Non-empty scalar value stored under `key` in the extras blob
    pub fn extra(&self, key: &str) -> Option<String> {
        self.extras
            .get(key)
            .and_then(scalar_to_string)
            .and_then(non_empty)
    }

    /// Non-empty first-class attribute addressed by name
    pub fn base_field(&self, key: &str) -> Option<String> {
        let value = match key {
            "host" => self.base.host.clone(),
            "schema" => self.base.schema.clone(),
            "port" => self.base.port.map(|p| p.to_string()),
            "login" => Some(self.login.clone()),
            "password" => Some(self.password.clone()),
            _ => None,
        };
        value.and_then(non_empty)
    }
}
