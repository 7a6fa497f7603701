use serde::Serialize;
use std::fmt;

use crate::config::PipelineConfig;

/// Logical fields the resolver produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Account,
    User,
    Password,
    Warehouse,
    Role,
    Database,
    Schema,
    QueryTag,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::Account => "account",
            Field::User => "user",
            Field::Password => "password",
            Field::Warehouse => "warehouse",
            Field::Role => "role",
            Field::Database => "database",
            Field::Schema => "schema",
            Field::QueryTag => "query_tag",
        }
    }

    /// Fields whose values must never reach logs or terminal output
    pub fn is_secret(&self) -> bool {
        matches!(self, Field::Password)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How to find one logical field in a connection record.
///
/// Candidate order is precedence order. Each candidate is tried plain and then
/// with `namespace_prefix` before moving to the next candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLookupSpec {
    pub candidate_keys: Vec<String>,
    pub namespace_prefix: String,
    pub fallback_default: Option<String>,
    pub required: bool,
}

impl FieldLookupSpec {
    pub fn new<I, S>(candidate_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidate_keys: candidate_keys.into_iter().map(Into::into).collect(),
            namespace_prefix: String::new(),
            fallback_default: None,
            required: true,
        }
    }

    pub fn namespaced(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    pub fn with_default(mut self, default: Option<String>) -> Self {
        self.fallback_default = default;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Extras keys in the exact order they are tried
    pub fn extras_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.candidate_keys.len() * 2);
        for key in &self.candidate_keys {
            keys.push(key.clone());
            if !self.namespace_prefix.is_empty() {
                keys.push(format!("{}{}", self.namespace_prefix, key));
            }
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub field: Field,
    /// Name of the emitted environment variable
    pub env_var: String,
    pub spec: FieldLookupSpec,
}

/// Ordered table of fields to resolve. Missing required fields are reported
/// in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupTable {
    entries: Vec<FieldEntry>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        field: Field,
        env_var: impl Into<String>,
        spec: FieldLookupSpec,
    ) -> Self {
        let env_var = env_var.into();
        self.entries.retain(|entry| entry.field != field);
        self.entries.push(FieldEntry {
            field,
            env_var,
            spec,
        });
        self
    }

    pub fn entries(&self) -> &[FieldEntry] {
        &self.entries
    }

    pub fn get(&self, field: Field) -> Option<&FieldEntry> {
        self.entries.iter().find(|entry| entry.field == field)
    }

    /// The dbt/Snowflake table: `<prefix>ACCOUNT` … `<prefix>SCHEMA` plus
    /// `DBT_QUERY_TAG`
    pub fn standard(config: &PipelineConfig) -> Self {
        let ns = config.namespace_prefix.as_str();
        let prefix = config.env_prefix.as_str();
        let defaults = &config.defaults;
        let var = |suffix: &str| format!("{}{}", prefix, suffix);

        Self::new()
            .with_entry(
                Field::Account,
                var("ACCOUNT"),
                FieldLookupSpec::new(["account"]).namespaced(ns),
            )
            .with_entry(
                Field::User,
                var("USER"),
                FieldLookupSpec::new(["login"]).namespaced(ns),
            )
            .with_entry(
                Field::Password,
                var("PASSWORD"),
                FieldLookupSpec::new(["password"]).namespaced(ns),
            )
            .with_entry(
                Field::Warehouse,
                var("WAREHOUSE"),
                FieldLookupSpec::new(["warehouse"])
                    .namespaced(ns)
                    .with_default(defaults.warehouse.clone()),
            )
            .with_entry(
                Field::Role,
                var("ROLE"),
                FieldLookupSpec::new(["role"])
                    .namespaced(ns)
                    .with_default(defaults.role.clone()),
            )
            .with_entry(
                Field::Database,
                var("DATABASE"),
                FieldLookupSpec::new(["database"])
                    .namespaced(ns)
                    .with_default(defaults.database.clone()),
            )
            .with_entry(
                Field::Schema,
                var("SCHEMA"),
                FieldLookupSpec::new(["schema"])
                    .namespaced(ns)
                    .with_default(defaults.schema.clone()),
            )
            .with_entry(
                Field::QueryTag,
                "DBT_QUERY_TAG",
                FieldLookupSpec::new(["query_tag"])
                    .namespaced(ns)
                    .with_default(Some(config.query_tag.clone())),
            )
    }
}
