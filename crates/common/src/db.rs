//! SQLite persistence for node-instance runtime properties

use crate::value::RuntimeProperties;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for runtime-property persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A stored runtime-property bag with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProperties {
    pub instance_id: String,
    pub properties: RuntimeProperties,
    pub revision: i64,
    pub updated_at: i64,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL so a concurrent reader (the CLI) never blocks a saving operation
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runtime_properties (
                instance_id TEXT PRIMARY KEY,
                properties TEXT NOT NULL DEFAULT '{}',
                updated_at INTEGER NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Load the runtime properties of an instance; empty if never saved.
    pub fn load_properties(&self, instance_id: &str) -> Result<RuntimeProperties> {
        Ok(self
            .get_properties(instance_id)?
            .map(|stored| stored.properties)
            .unwrap_or_default())
    }

    /// Load the stored row of an instance.
    pub fn get_properties(&self, instance_id: &str) -> Result<Option<StoredProperties>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT properties, revision, updated_at FROM runtime_properties WHERE instance_id = ?1",
                params![instance_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((properties, revision, updated_at)) => {
                let properties = match serde_json::from_str(&properties)? {
                    serde_json::Value::Object(map) => map,
                    other => {
                        return Err(Error::InvalidConfig(format!(
                            "runtime properties of {} are not a map: {}",
                            instance_id, other
                        )))
                    }
                };
                Ok(Some(StoredProperties {
                    instance_id: instance_id.to_string(),
                    properties,
                    revision,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Replace the runtime properties of an instance, bumping its revision.
    /// Returns the new revision.
    pub fn save_properties(&self, instance_id: &str, properties: &RuntimeProperties) -> Result<i64> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO runtime_properties (instance_id, properties, updated_at, revision)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(instance_id) DO UPDATE SET
                properties = excluded.properties,
                updated_at = excluded.updated_at,
                revision = runtime_properties.revision + 1",
            params![instance_id, serde_json::to_string(properties)?, now],
        )?;

        let revision: i64 = conn.query_row(
            "SELECT revision FROM runtime_properties WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;

        debug!("Saved runtime properties of {} (revision {})", instance_id, revision);
        Ok(revision)
    }

    /// Forget an instance entirely
    pub fn delete_properties(&self, instance_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM runtime_properties WHERE instance_id = ?1",
            params![instance_id],
        )?;
        debug!("Deleted runtime properties of {}", instance_id);
        Ok(count > 0)
    }

    /// All instance ids with stored properties
    pub fn list_instances(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT instance_id FROM runtime_properties ORDER BY instance_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> RuntimeProperties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_crud() {
        let db = Database::open_memory().unwrap();

        assert!(db.load_properties("net1_abc").unwrap().is_empty());

        let rev = db
            .save_properties("net1_abc", &props(json!({"resource_id": "net1"})))
            .unwrap();
        assert_eq!(rev, 1);

        let rev = db
            .save_properties(
                "net1_abc",
                &props(json!({"resource_id": "net1", "__created": true})),
            )
            .unwrap();
        assert_eq!(rev, 2);

        let stored = db.get_properties("net1_abc").unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.properties["__created"], json!(true));

        assert_eq!(db.list_instances().unwrap(), vec!["net1_abc".to_string()]);

        assert!(db.delete_properties("net1_abc").unwrap());
        assert!(!db.delete_properties("net1_abc").unwrap());
        assert!(db.get_properties("net1_abc").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let db = Database::open(&path).unwrap();
            db.save_properties("vm1_x", &props(json!({"__RETRY_BAD_REQUEST": true})))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let loaded = db.load_properties("vm1_x").unwrap();
        assert_eq!(loaded["__RETRY_BAD_REQUEST"], json!(true));
    }
}
