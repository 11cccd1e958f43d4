use serde_json::Value;
use tracing::info;

use crate::database::{Document, Record};
use crate::error::{Result, StoreError};
use crate::settings::{ProfileRecord, SettingsRecord};

pub const APP_SCHEMA_VERSION: u32 = 2;

pub type MigrationFn = fn(&mut Document) -> Result<()>;

/// Upgrades a document from schema version `from` to `from + 1`.
#[derive(Clone)]
pub struct Migration {
    pub from: u32,
    pub description: &'static str,
    pub apply: MigrationFn,
}

#[derive(Clone)]
pub struct SchemaSet {
    pub version: u32,
    pub collections: Vec<&'static str>,
    pub migrations: Vec<Migration>,
}

impl SchemaSet {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            collections: Vec::new(),
            migrations: Vec::new(),
        }
    }

    pub fn with_collection(mut self, name: &'static str) -> Self {
        if !self.collections.contains(&name) {
            self.collections.push(name);
        }
        self
    }

    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.from);
        self
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.collections.iter().any(|c| *c == collection)
    }

    /// Runs every migration between `from` and the current version in order.
    pub fn migrate(&self, doc: &mut Document, from: u32) -> Result<()> {
        if from > self.version {
            return Err(StoreError::SchemaTooNew {
                found: from,
                supported: self.version,
            });
        }
        for version in from..self.version {
            let migration = self
                .migrations
                .iter()
                .find(|m| m.from == version)
                .ok_or_else(|| StoreError::Migration {
                    from: version,
                    reason: "no migration registered".into(),
                })?;
            info!(from = version, to = version + 1, step = migration.description, "migrating store schema");
            (migration.apply)(doc).map_err(|e| match e {
                StoreError::Migration { .. } => e,
                other => StoreError::Migration {
                    from: version,
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchemaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaSet")
            .field("version", &self.version)
            .field("collections", &self.collections)
            .field("migrations", &self.migrations.len())
            .finish()
    }
}

/// Schemas of the eRezept client store.
pub fn app_schemas() -> SchemaSet {
    SchemaSet::new(APP_SCHEMA_VERSION)
        .with_collection(SettingsRecord::COLLECTION)
        .with_collection(ProfileRecord::COLLECTION)
        .with_migration(Migration {
            from: 1,
            description: "rename settings.zoom to settings.zoom_enabled",
            apply: rename_zoom_flag,
        })
}

fn rename_zoom_flag(doc: &mut Document) -> Result<()> {
    for record in doc.collection_mut(SettingsRecord::COLLECTION) {
        let Value::Object(fields) = record else {
            return Err(StoreError::Migration {
                from: 1,
                reason: "settings record is not an object".into(),
            });
        };
        if let Some(zoom) = fields.remove("zoom") {
            fields.entry("zoom_enabled").or_insert(zoom);
        }
    }
    Ok(())
}
