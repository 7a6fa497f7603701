//! Configuration resolution: connection record + lookup table → flat
//! environment.
//!
//! Per field, in precedence order:
//!
//! 1. extras, each candidate key plain then namespaced, in candidate order
//! 2. first-class attributes, in candidate order
//! 3. the fallback default
//!
//! The account field has one extra step: when still absent it is derived from
//! the host by cutting the provider domain suffix. A required field that stays
//! absent fails the whole resolution with `MissingRequiredField`.
//!
//! Resolution reads nothing but the record and the values captured when the
//! resolver was built, so repeated calls with the same record give identical
//! results.

mod environment;
mod search_path;
mod spec;

pub use environment::{ResolvedEnvironment, ValueSource, MASK, PATH_VAR};
pub use search_path::SearchPath;
pub use spec::{Field, FieldEntry, FieldLookupSpec, LookupTable};

use crate::config::PipelineConfig;
use crate::connection::ConnectionRecord;
use crate::error::{DbtflowError, Result};

/// Find a field's value with the generic lookup order, defaults included
pub fn lookup_field(
    record: &ConnectionRecord,
    spec: &FieldLookupSpec,
) -> Option<(String, ValueSource)> {
    for key in spec.extras_keys() {
        if let Some(value) = record.extra(&key) {
            return Some((value, ValueSource::Extras(key)));
        }
    }

    for key in &spec.candidate_keys {
        if let Some(value) = record.base_field(key) {
            return Some((value, ValueSource::BaseField(key.clone())));
        }
    }

    spec.fallback_default
        .as_ref()
        .filter(|value| !value.is_empty())
        .map(|value| (value.clone(), ValueSource::Default))
}

/// Derives the account identifier from a host such as
/// `xy12345.snowflakecomputing.com`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDerivation {
    host_spec: FieldLookupSpec,
    suffix: String,
}

impl AccountDerivation {
    pub fn new(namespace_prefix: &str, suffix: impl Into<String>) -> Self {
        Self {
            host_spec: FieldLookupSpec::new(["host"])
                .namespaced(namespace_prefix)
                .optional(),
            suffix: suffix.into(),
        }
    }

    /// Everything in the host before the first occurrence of the suffix.
    /// The suffix match ignores ASCII case.
    pub fn derive(&self, record: &ConnectionRecord) -> Option<String> {
        if self.suffix.is_empty() {
            return None;
        }
        let (host, _) = lookup_field(record, &self.host_spec)?;
        let position = host
            .to_ascii_lowercase()
            .find(&self.suffix.to_ascii_lowercase())?;
        let account = &host[..position];
        if account.is_empty() {
            None
        } else {
            Some(account.to_string())
        }
    }
}

pub struct ConfigResolver {
    table: LookupTable,
    account_derivation: Option<AccountDerivation>,
    search_path: SearchPath,
}

impl ConfigResolver {
    pub fn new(table: LookupTable, search_path: SearchPath) -> Self {
        Self {
            table,
            account_derivation: None,
            search_path,
        }
    }

    pub fn with_account_derivation(mut self, derivation: AccountDerivation) -> Self {
        self.account_derivation = Some(derivation);
        self
    }

    /// Standard dbt/Snowflake resolver. Captures the executable location and
    /// the inherited PATH once, here.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let resolver = Self::new(
            LookupTable::standard(config),
            SearchPath::capture(config.tool_bin_dir.as_deref()),
        );
        if config.account_host_suffix.is_empty() {
            resolver
        } else {
            resolver.with_account_derivation(AccountDerivation::new(
                &config.namespace_prefix,
                config.account_host_suffix.clone(),
            ))
        }
    }

    pub fn resolve(&self, record: &ConnectionRecord) -> Result<ResolvedEnvironment> {
        let mut env = ResolvedEnvironment::new();

        for entry in self.table.entries() {
            let mut found = lookup_field(record, &entry.spec);

            if found.is_none() && entry.field == Field::Account {
                found = self.derive_account_from_host(record);
            }

            match found {
                Some((value, source)) => {
                    tracing::debug!("Resolved {} from {}", entry.env_var, source);
                    env.insert(&entry.env_var, value, source, entry.field.is_secret());
                }
                None if entry.spec.required => {
                    tracing::error!(
                        "No value for required field '{}' in connection '{}'",
                        entry.field,
                        record.conn_id
                    );
                    return Err(DbtflowError::missing_field(entry.field.name()));
                }
                None => {
                    tracing::debug!("Optional field '{}' left unset", entry.field);
                }
            }
        }

        if let Some(path) = self.search_path.render()? {
            env.insert(PATH_VAR, path, ValueSource::SearchPath, false);
        }
        env.set_tool_dir(self.search_path.tool_dir().map(|dir| dir.to_path_buf()));

        Ok(env)
    }

    fn derive_account_from_host(
        &self,
        record: &ConnectionRecord,
    ) -> Option<(String, ValueSource)> {
        let derivation = self.account_derivation.as_ref()?;
        let account = derivation.derive(record)?;
        Some((account, ValueSource::DerivedFromHost))
    }
}
