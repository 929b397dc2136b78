use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::{open_registry_connection, KernelError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Installed,
    Updating,
    Failed,
    Removed,
}

impl ModuleStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Installed => "installed",
            ModuleStatus::Updating => "updating",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Removed => "removed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "installed" => Ok(ModuleStatus::Installed),
            "updating" => Ok(ModuleStatus::Updating),
            "failed" => Ok(ModuleStatus::Failed),
            "removed" => Ok(ModuleStatus::Removed),
            other => Err(KernelError::Storage(anyhow!(
                "corrupt registry: unknown module status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub source_url: String,
    pub revision: String,
    pub install_path: PathBuf,
    pub status: ModuleStatus,
    /// seconds since epoch
    pub installed_at: u64,
    /// seconds since epoch
    pub updated_at: u64,
}

/// Durable name -> record map. Every mutation is committed before it returns.
pub trait ModuleStore: Send {
    fn get(&mut self, name: &str) -> Result<Option<ModuleRecord>>;

    /// Insert or replace. Replacing keeps the original install ordering.
    fn put(&mut self, record: &ModuleRecord) -> Result<()>;

    /// Returns whether a record was deleted.
    fn delete(&mut self, name: &str) -> Result<bool>;

    /// All records ordered by install time.
    fn list(&mut self) -> Result<Vec<ModuleRecord>>;
}

pub struct SqliteModuleStore {
    conn: Connection,
}

impl SqliteModuleStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_registry_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS modules (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE,
              source_url TEXT NOT NULL,
              revision TEXT NOT NULL,
              install_path TEXT NOT NULL,
              status TEXT NOT NULL,
              installed_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_modules_installed ON modules(installed_at, id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(ModuleRecord, String)> {
        let installed_at: i64 = row.get(5)?;
        let updated_at: i64 = row.get(6)?;
        let status: String = row.get(4)?;
        let install_path: String = row.get(3)?;
        Ok((
            ModuleRecord {
                name: row.get(0)?,
                source_url: row.get(1)?,
                revision: row.get(2)?,
                install_path: PathBuf::from(install_path),
                status: ModuleStatus::Installed,
                installed_at: installed_at.max(0) as u64,
                updated_at: updated_at.max(0) as u64,
            },
            status,
        ))
    }

    fn finish(parsed: (ModuleRecord, String)) -> Result<ModuleRecord> {
        let (mut record, status) = parsed;
        record.status = ModuleStatus::parse(&status)?;
        Ok(record)
    }
}

const SELECT_COLUMNS: &str =
    "SELECT name, source_url, revision, install_path, status, installed_at, updated_at FROM modules";

impl ModuleStore for SqliteModuleStore {
    fn get(&mut self, name: &str) -> Result<Option<ModuleRecord>> {
        let parsed = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE name = ?1"),
                params![name],
                Self::row_to_record,
            )
            .optional()?;
        parsed.map(Self::finish).transpose()
    }

    fn put(&mut self, record: &ModuleRecord) -> Result<()> {
        let installed_at = i64::try_from(record.installed_at)
            .map_err(|_| KernelError::Storage(anyhow!("installed_at exceeds i64 range")))?;
        let updated_at = i64::try_from(record.updated_at)
            .map_err(|_| KernelError::Storage(anyhow!("updated_at exceeds i64 range")))?;
        self.conn.execute(
            r#"
            INSERT INTO modules(name, source_url, revision, install_path, status, installed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO UPDATE SET
              source_url = excluded.source_url,
              revision = excluded.revision,
              install_path = excluded.install_path,
              status = excluded.status,
              updated_at = excluded.updated_at
            "#,
            params![
                record.name,
                record.source_url,
                record.revision,
                record.install_path.to_string_lossy(),
                record.status.as_str(),
                installed_at,
                updated_at
            ],
        )?;
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM modules WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    fn list(&mut self) -> Result<Vec<ModuleRecord>> {
        let parsed = {
            let mut stmt = self
                .conn
                .prepare(&format!("{SELECT_COLUMNS} ORDER BY installed_at ASC, id ASC"))?;
            let rows = stmt.query_map([], Self::row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        parsed.into_iter().map(Self::finish).collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryModuleStore {
    next_seq: u64,
    records: BTreeMap<String, (u64, ModuleRecord)>,
}

impl ModuleStore for InMemoryModuleStore {
    fn get(&mut self, name: &str) -> Result<Option<ModuleRecord>> {
        Ok(self.records.get(name).map(|(_, r)| r.clone()))
    }

    fn put(&mut self, record: &ModuleRecord) -> Result<()> {
        if let Some((_, existing)) = self.records.get_mut(&record.name) {
            let installed_at = existing.installed_at;
            *existing = record.clone();
            existing.installed_at = installed_at;
            return Ok(());
        }
        self.next_seq += 1;
        self.records
            .insert(record.name.clone(), (self.next_seq, record.clone()));
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<bool> {
        Ok(self.records.remove(name).is_some())
    }

    fn list(&mut self) -> Result<Vec<ModuleRecord>> {
        let mut entries: Vec<&(u64, ModuleRecord)> = self.records.values().collect();
        entries.sort_by_key(|(seq, r)| (r.installed_at, *seq));
        Ok(entries.into_iter().map(|(_, r)| r.clone()).collect())
    }
}

/// Thread-safe registry shared by the installer and readers.
///
/// Each call holds the store lock for its whole duration, so readers never
/// observe a half-applied mutation from this process. Other processes are
/// isolated by SQLite transactions.
pub struct ModuleRegistry {
    store: Mutex<Box<dyn ModuleStore>>,
}

impl ModuleRegistry {
    pub fn new(store: Box<dyn ModuleStore>) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(Box::new(SqliteModuleStore::open(db_path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryModuleStore::default()))
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut dyn ModuleStore) -> Result<T>) -> Result<T> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| KernelError::Storage(anyhow!("module registry lock poisoned")))?;
        f(&mut **guard)
    }

    pub fn get(&self, name: &str) -> Result<Option<ModuleRecord>> {
        self.with_store(|s| s.get(name))
    }

    pub fn put(&self, record: &ModuleRecord) -> Result<()> {
        self.with_store(|s| s.put(record))
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.with_store(|s| s.delete(name))
    }

    pub fn list(&self) -> Result<Vec<ModuleRecord>> {
        self.with_store(|s| s.list())
    }

    /// Records in a loadable state, for startup module discovery.
    pub fn installed(&self) -> Result<Vec<ModuleRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.status == ModuleStatus::Installed)
            .collect())
    }
}
