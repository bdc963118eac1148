//! Connection-related data models.
//!
//! A [`ConnectionDescriptor`] is supplied by the configuration layer and is
//! never persisted by the gateway. Anything that leaves the process (tool
//! responses, logs, `Debug` output) goes through [`ConnectionDescriptor::redacted`].

use crate::tools::redact::{redact_properties, redact_value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Connection parameters for one configured backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Dialect-indicating driver name, e.g. "postgres", "mariadb", "mssql".
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Database name, or the file path for SQLite.
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    /// Free-form properties. Holds `password`, `sslmode` and friends.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ConnectionDescriptor {
    /// Create a descriptor with no properties.
    pub fn new(id: impl Into<String>, driver: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            driver: driver.into(),
            host: String::new(),
            port: None,
            database: String::new(),
            user: String::new(),
            properties: HashMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property case-insensitively, trying each key in order.
    pub fn property(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| {
            self.properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn password(&self) -> Option<&str> {
        self.property(&["password", "pwd", "passwd"])
    }

    /// JSON form with every secret-shaped property replaced by the redaction marker.
    pub fn redacted(&self) -> serde_json::Value {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        redact_value(&value)
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("properties", &redact_properties(&self.properties))
            .finish()
    }
}
