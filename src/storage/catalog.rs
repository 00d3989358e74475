//! SQLite catalog of everything migrated into the Warm archive

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::keywords;

/// What kind of thing an archive unit is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// A whole file moved out of the Hot directory
    File,
    /// Stale lines moved out of the Observations Log
    Observations,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::File => write!(f, "file"),
            UnitKind::Observations => write!(f, "observations"),
        }
    }
}

impl std::str::FromStr for UnitKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(UnitKind::File),
            "observations" => Ok(UnitKind::Observations),
            _ => Err(Error::storage(format!("Invalid unit kind: {}", s))),
        }
    }
}

/// One archived unit
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    pub id: Uuid,
    pub kind: UnitKind,
    pub path: PathBuf,
    /// File name to use if this unit is recovered into Hot
    pub restore_name: String,
    pub category: String,
    pub archived_at: DateTime<Local>,
    pub content: String,
}

impl ArchiveRecord {
    pub fn new(
        kind: UnitKind,
        path: impl Into<PathBuf>,
        restore_name: impl Into<String>,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            path: path.into(),
            restore_name: restore_name.into(),
            category: category.into(),
            archived_at: Local::now(),
            content: content.into(),
        }
    }
}

/// SQLite-backed archive catalog
#[derive(Clone)]
pub struct ArchiveCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl ArchiveCatalog {
    /// Open (or create) the catalog at `path`
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn record(&self, record: &ArchiveRecord) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO archive_units (
                id, kind, path, restore_name, category, archived_at, content
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id.to_string(),
                record.kind.to_string(),
                record.path.to_string_lossy(),
                record.restore_name,
                record.category,
                record.archived_at.to_rfc3339(),
                record.content,
            ],
        )?;

        Ok(())
    }

    /// Units whose content mentions the query's keywords, best match first
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ArchiveRecord>> {
        let words = keywords(query);
        if words.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let clauses = vec!["LOWER(content) LIKE ?"; words.len()].join(" OR ");
        let sql = format!(
            r#"
            SELECT id, kind, path, restore_name, category, archived_at, content
            FROM archive_units WHERE {}
            ORDER BY archived_at DESC
            "#,
            clauses
        );
        let patterns: Vec<String> = words.iter().map(|w| format!("%{}%", w)).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(patterns.iter()), |row| {
            Ok(CatalogRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                path: row.get(2)?,
                restore_name: row.get(3)?,
                category: row.get(4)?,
                archived_at: row.get(5)?,
                content: row.get(6)?,
            })
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let record = row?.into_record()?;
            let lower = record.content.to_lowercase();
            let score = words.iter().filter(|w| lower.contains(w.as_str())).count();
            // at least half of the query's keywords must appear
            if score * 2 >= words.len() {
                scored.push((score, record));
            }
        }

        // stable: ties keep newest-first order
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM archive_units", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Raw row from the archive_units table
struct CatalogRow {
    id: String,
    kind: String,
    path: String,
    restore_name: String,
    category: String,
    archived_at: String,
    content: String,
}

impl CatalogRow {
    fn into_record(self) -> Result<ArchiveRecord> {
        Ok(ArchiveRecord {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::storage(e.to_string()))?,
            kind: self.kind.parse()?,
            path: PathBuf::from(self.path),
            restore_name: self.restore_name,
            category: self.category,
            archived_at: DateTime::parse_from_rfc3339(&self.archived_at)
                .map_err(|e| Error::storage(e.to_string()))?
                .with_timezone(&Local),
            content: self.content,
        })
    }
}
