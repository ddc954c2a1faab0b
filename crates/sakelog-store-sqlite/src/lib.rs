use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use sakelog_core::{ancestors, Category, CategoryId, CategoryLogEntry, ParentMap};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS categories (
  id INTEGER PRIMARY KEY CHECK (id >= 1),
  name TEXT NOT NULL,
  parent INTEGER,
  description TEXT,
  image_url TEXT,
  image_base64 TEXT,
  version_no INTEGER CHECK (version_no IS NULL OR version_no >= 1),
  sort_order INTEGER,
  readonly INTEGER NOT NULL DEFAULT 0 CHECK (readonly IN (0, 1)),
  create_user_id TEXT,
  create_user_name TEXT,
  update_user_id TEXT,
  update_user_name TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories_logs (
  log_id INTEGER PRIMARY KEY AUTOINCREMENT,
  id INTEGER NOT NULL,
  name TEXT NOT NULL,
  parent INTEGER,
  description TEXT,
  image_url TEXT,
  image_base64 TEXT,
  version_no INTEGER,
  sort_order INTEGER,
  readonly INTEGER NOT NULL DEFAULT 0 CHECK (readonly IN (0, 1)),
  create_user_id TEXT,
  create_user_name TEXT,
  update_user_id TEXT,
  update_user_name TEXT,
  updated_at TEXT NOT NULL,
  logged_at TEXT NOT NULL,
  UNIQUE(id, version_no)
);

CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent);
CREATE INDEX IF NOT EXISTS idx_categories_logs_id ON categories_logs(id, version_no);
";

// Collections imported before the sibling rule existed may hold duplicates; the index build
// fails loudly in that case instead of silently keeping them.
const MIGRATION_002_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_parent_name ON categories(parent, name);
";

const CATEGORY_COLUMNS: &str = "id, name, parent, description, image_url, image_base64, \
     version_no, sort_order, readonly, create_user_id, create_user_name, update_user_id, \
     update_user_name, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateSiblingName {
    pub parent: Option<CategoryId>,
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub orphaned_categories: Vec<CategoryId>,
    pub cyclic_categories: Vec<CategoryId>,
    pub duplicate_sibling_names: Vec<DuplicateSiblingName>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.orphaned_categories.is_empty()
            && self.cyclic_categories.is_empty()
            && self.duplicate_sibling_names.is_empty()
    }
}

/// One atomic unit of work against the live table and its log.
#[derive(Debug, Clone, Copy)]
pub enum CategoryCommit<'a> {
    /// The id on the record is ignored; the next free id is allocated inside the transaction.
    Create(&'a Category),
    /// `previous` is logged as-is before `record` replaces it.
    Update { previous: &'a Category, record: &'a Category },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { id: CategoryId },
    /// The stored version moved after `previous` was read; nothing was written.
    VersionConflict { stored: Option<i64> },
    /// The live row disappeared after `previous` was read; nothing was written.
    Missing,
}

impl SqliteStore {
    /// Open a SQLite-backed category store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "categories")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "categories", "id")?
            && table_has_column(&self.conn, "categories", "name")?
            && table_exists(&self.conn, "categories_logs")?
        {
            // Tables were created by hand or imported without migration records.
            record_schema_version(&self.conn, 1)?;
            tracing::info!("adopted unversioned category tables as schema version 1");
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: categories table lacks id/name or its log table"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL)
            .context("failed to create sibling name index; resolve duplicate sibling names first")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 2")?;
        tx.commit().context("failed to commit migration v2")?;
        tracing::info!(version = 2, "applied category schema migration");
        Ok(())
    }

    /// Load one live category by id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_category(&self, id: CategoryId) -> Result<Option<Category>> {
        let query = format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1");
        let row = self
            .conn
            .query_row(&query, params![id], CategoryRow::read)
            .optional()
            .with_context(|| format!("failed to load category {id}"))?;
        row.map(CategoryRow::into_category).transpose()
    }

    /// Find a live category named `name` directly under `parent`, ignoring `exclude_id`.
    ///
    /// A `None` parent matches root categories.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_category_by_parent_and_name(
        &self,
        parent: Option<CategoryId>,
        name: &str,
        exclude_id: Option<CategoryId>,
    ) -> Result<Option<Category>> {
        let query = format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories
             WHERE parent IS ?1 AND name = ?2 AND (?3 IS NULL OR id <> ?3)
             LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&query, params![parent, name, exclude_id], CategoryRow::read)
            .optional()
            .context("failed to look up sibling category by name")?;
        row.map(CategoryRow::into_category).transpose()
    }

    /// Load every live category ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let query = format!("SELECT {CATEGORY_COLUMNS} FROM categories ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], CategoryRow::read)?;

        let mut categories = Vec::new();
        for row in rows {
            categories.push(row?.into_category()?);
        }
        Ok(categories)
    }

    /// Load the id-to-parent adjacency of the live tree.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read.
    pub fn parent_map(&self) -> Result<ParentMap> {
        let mut stmt = self.conn.prepare("SELECT id, parent FROM categories")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, CategoryId>(0)?, row.get::<_, Option<CategoryId>>(1)?))
        })?;

        let mut parents = ParentMap::new();
        for row in rows {
            let (id, parent) = row?;
            parents.insert(id, parent);
        }
        Ok(parents)
    }

    /// Load the log entry that recorded `version_no` of category `id`.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_log_by_version(
        &self,
        id: CategoryId,
        version_no: i64,
    ) -> Result<Option<CategoryLogEntry>> {
        let query = format!(
            "SELECT {CATEGORY_COLUMNS}, logged_at FROM categories_logs
             WHERE id = ?1 AND version_no = ?2"
        );
        let row = self
            .conn
            .query_row(&query, params![id, version_no], LogRow::read)
            .optional()
            .with_context(|| format!("failed to load log entry {id}@{version_no}"))?;
        row.map(LogRow::into_entry).transpose()
    }

    /// Load the full change log of one category, newest version first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_logs(&self, id: CategoryId) -> Result<Vec<CategoryLogEntry>> {
        let query = format!(
            "SELECT {CATEGORY_COLUMNS}, logged_at FROM categories_logs
             WHERE id = ?1
             ORDER BY COALESCE(version_no, 0) DESC, log_id DESC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![id], LogRow::read)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Apply a create, or a log-then-replace update, as one IMMEDIATE transaction.
    ///
    /// Creates allocate `MAX(id) + 1` inside the transaction, so concurrent creators never race
    /// for the same id.
    ///
    /// For updates the stored version is re-read inside the transaction so that a concurrent
    /// writer that committed first turns this call into [`CommitOutcome::VersionConflict`].
    ///
    /// # Errors
    /// Returns an error when any statement fails; the transaction is rolled back.
    pub fn commit_category(&mut self, commit: CategoryCommit<'_>) -> Result<CommitOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start category transaction")?;

        let id = match commit {
            CategoryCommit::Create(record) => {
                let id = max_category_id(&tx)? + 1;
                insert_live(&tx, &Category { id, ..record.clone() })?;
                id
            }
            CategoryCommit::Update { previous, record } => {
                let stored = tx
                    .query_row(
                        "SELECT version_no FROM categories WHERE id = ?1",
                        params![previous.id],
                        |row| row.get::<_, Option<i64>>(0),
                    )
                    .optional()
                    .context("failed to re-read stored category version")?;
                let Some(stored) = stored else {
                    return Ok(CommitOutcome::Missing);
                };
                if stored.unwrap_or(0) != previous.current_version() {
                    tracing::warn!(
                        category_id = previous.id,
                        expected = previous.current_version(),
                        stored = stored.unwrap_or(0),
                        "category version moved during commit"
                    );
                    return Ok(CommitOutcome::VersionConflict { stored });
                }

                insert_log(&tx, previous, OffsetDateTime::now_utc())?;
                replace_live(&tx, record)?;
                record.id
            }
        };

        tx.commit().context("failed to commit category transaction")?;
        Ok(CommitOutcome::Applied { id })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check plus tree-shape probes: orphans, cycles, and duplicate sibling names.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let parents = self.parent_map()?;
        let mut orphaned_categories = Vec::new();
        let mut cyclic = BTreeSet::new();
        for (id, parent) in &parents {
            if let Some(parent) = parent {
                if !parents.contains_key(parent) {
                    orphaned_categories.push(*id);
                }
            }
            if ancestors(&parents, *id).is_err() {
                cyclic.insert(*id);
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT parent, name, COUNT(*) FROM categories
             GROUP BY parent, name
             HAVING COUNT(*) > 1
             ORDER BY parent ASC, name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DuplicateSiblingName { parent: row.get(0)?, name: row.get(1)?, count: row.get(2)? })
        })?;
        let mut duplicate_sibling_names = Vec::new();
        for row in rows {
            duplicate_sibling_names.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            orphaned_categories,
            cyclic_categories: cyclic.into_iter().collect(),
            duplicate_sibling_names,
            schema_status,
        })
    }
}

#[derive(Debug)]
struct CategoryRow {
    id: CategoryId,
    name: String,
    parent: Option<CategoryId>,
    description: Option<String>,
    image_url: Option<String>,
    image_base64: Option<String>,
    version_no: Option<i64>,
    sort_order: Option<i64>,
    readonly: bool,
    create_user_id: Option<String>,
    create_user_name: Option<String>,
    update_user_id: Option<String>,
    update_user_name: Option<String>,
    updated_at: String,
}

impl CategoryRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            parent: row.get(2)?,
            description: row.get(3)?,
            image_url: row.get(4)?,
            image_base64: row.get(5)?,
            version_no: row.get(6)?,
            sort_order: row.get(7)?,
            readonly: row.get(8)?,
            create_user_id: row.get(9)?,
            create_user_name: row.get(10)?,
            update_user_id: row.get(11)?,
            update_user_name: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_category(self) -> Result<Category> {
        Ok(Category {
            id: self.id,
            name: self.name,
            parent: self.parent,
            description: self.description,
            image_url: self.image_url,
            image_base64: self.image_base64,
            version_no: self.version_no,
            order: self.sort_order,
            readonly: self.readonly,
            create_user_id: self.create_user_id,
            create_user_name: self.create_user_name,
            update_user_id: self.update_user_id,
            update_user_name: self.update_user_name,
            updated_at: parse_rfc3339(&self.updated_at)?,
            children: Vec::new(),
        })
    }
}

#[derive(Debug)]
struct LogRow {
    category: CategoryRow,
    logged_at: String,
}

impl LogRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self { category: CategoryRow::read(row)?, logged_at: row.get(14)? })
    }

    fn into_entry(self) -> Result<CategoryLogEntry> {
        Ok(CategoryLogEntry {
            snapshot: self.category.into_category()?,
            logged_at: parse_rfc3339(&self.logged_at)?,
        })
    }
}

/// Largest allocated category id, or 0 for an empty table.
fn max_category_id(conn: &Connection) -> Result<CategoryId> {
    conn.query_row("SELECT COALESCE(MAX(id), 0) FROM categories", [], |row| row.get(0))
        .context("failed to read max category id")
}

fn insert_live(tx: &rusqlite::Transaction<'_>, record: &Category) -> Result<()> {
    let statement = format!(
        "INSERT INTO categories({CATEGORY_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    );
    tx.execute(
        &statement,
        params![
            record.id,
            record.name,
            record.parent,
            record.description,
            record.image_url,
            record.image_base64,
            record.version_no,
            record.order,
            record.readonly,
            record.create_user_id,
            record.create_user_name,
            record.update_user_id,
            record.update_user_name,
            rfc3339(record.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to insert category {}", record.id))?;
    Ok(())
}

fn insert_log(
    tx: &rusqlite::Transaction<'_>,
    previous: &Category,
    logged_at: OffsetDateTime,
) -> Result<()> {
    let statement = format!(
        "INSERT INTO categories_logs({CATEGORY_COLUMNS}, logged_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
    );
    tx.execute(
        &statement,
        params![
            previous.id,
            previous.name,
            previous.parent,
            previous.description,
            previous.image_url,
            previous.image_base64,
            previous.version_no,
            previous.order,
            previous.readonly,
            previous.create_user_id,
            previous.create_user_name,
            previous.update_user_id,
            previous.update_user_name,
            rfc3339(previous.updated_at)?,
            rfc3339(logged_at)?,
        ],
    )
    .with_context(|| format!("failed to append log entry for category {}", previous.id))?;
    Ok(())
}

fn replace_live(tx: &rusqlite::Transaction<'_>, record: &Category) -> Result<()> {
    let changed = tx
        .execute(
            "UPDATE categories SET
                name = ?2, parent = ?3, description = ?4, image_url = ?5, image_base64 = ?6,
                version_no = ?7, sort_order = ?8, readonly = ?9,
                create_user_id = ?10, create_user_name = ?11,
                update_user_id = ?12, update_user_name = ?13, updated_at = ?14
             WHERE id = ?1",
            params![
                record.id,
                record.name,
                record.parent,
                record.description,
                record.image_url,
                record.image_base64,
                record.version_no,
                record.order,
                record.readonly,
                record.create_user_id,
                record.create_user_name,
                record.update_user_id,
                record.update_user_name,
                rfc3339(record.updated_at)?,
            ],
        )
        .with_context(|| format!("failed to replace category {}", record.id))?;
    if changed != 1 {
        return Err(anyhow!("replace of category {} touched {changed} rows", record.id));
    }
    Ok(())
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    sqlite_master_has(conn, "table", table_name)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    sqlite_master_has(conn, "index", index_name)
}

fn sqlite_master_has(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            params![kind, name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if {kind} exists: {name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "categories")? {
        return Ok((0, false));
    }

    if index_exists(conn, "idx_categories_parent_name")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use ulid::Ulid;

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_category(id: CategoryId, name: &str, parent: Option<CategoryId>) -> Category {
        Category {
            id,
            name: name.to_string(),
            parent,
            description: Some(format!("{name} description")),
            image_url: None,
            image_base64: None,
            version_no: Some(1),
            order: None,
            readonly: false,
            create_user_id: Some("u-1".to_string()),
            create_user_name: Some("tester".to_string()),
            update_user_id: Some("u-1".to_string()),
            update_user_name: Some("tester".to_string()),
            updated_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000),
            children: Vec::new(),
        }
    }

    // Fixtures need fixed ids, so they bypass allocation.
    fn seed(store: &mut SqliteStore, category: &Category) -> Result<()> {
        let tx = store.conn.transaction()?;
        insert_live(&tx, category)?;
        tx.commit()?;
        Ok(())
    }

    fn create(store: &mut SqliteStore, category: &Category) -> Result<CategoryId> {
        match store.commit_category(CategoryCommit::Create(category))? {
            CommitOutcome::Applied { id } => Ok(id),
            other => Err(anyhow!("create should apply, got {other:?}")),
        }
    }

    fn log_count(store: &SqliteStore) -> Result<i64> {
        Ok(store.conn.query_row("SELECT COUNT(*) FROM categories_logs", [], |row| row.get(0))?)
    }

    #[test]
    fn migrate_creates_latest_schema() -> Result<()> {
        let store = migrated_memory_store()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut store = migrated_memory_store()?;
        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn schema_status_reports_pending_migration_for_unversioned_tables() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_rejects_legacy_duplicate_sibling_names() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        for id in [2_i64, 3] {
            store.conn.execute(
                "INSERT INTO categories(id, name, parent, updated_at) VALUES (?1, 'Junmai', 1, ?2)",
                params![id, "2026-01-01T00:00:00Z"],
            )?;
        }

        let err = match store.migrate() {
            Ok(()) => panic!("migration should fail on duplicate sibling names"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("sibling name index"));
        Ok(())
    }

    #[test]
    fn legacy_rows_without_version_load_as_unversioned() -> Result<()> {
        let store = migrated_memory_store()?;
        store.conn.execute(
            "INSERT INTO categories(id, name, parent, updated_at) VALUES (1, 'Sake', NULL, ?1)",
            params!["2026-01-01T00:00:00Z"],
        )?;

        let Some(loaded) = store.get_category(1)? else {
            panic!("legacy row should load");
        };
        assert_eq!(loaded.version_no, None);
        assert_eq!(loaded.current_version(), 0);
        assert!(!loaded.readonly);
        Ok(())
    }

    #[test]
    fn create_and_read_category_round_trip() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let mut category = mk_category(1, "Sake", None);
        category.readonly = true;
        category.order = Some(3);
        category.image_url = Some("https://cdn.example/sake.png".to_string());
        seed(&mut store, &category)?;

        assert_eq!(store.get_category(1)?, Some(category));
        assert_eq!(store.get_category(2)?, None);
        Ok(())
    }

    #[test]
    fn max_category_id_is_zero_for_empty_table() -> Result<()> {
        let store = migrated_memory_store()?;
        assert_eq!(max_category_id(&store.conn)?, 0);
        Ok(())
    }

    #[test]
    fn created_categories_take_the_next_free_id() -> Result<()> {
        let mut store = migrated_memory_store()?;
        assert_eq!(create(&mut store, &mk_category(42, "Sake", None))?, 1);
        seed(&mut store, &mk_category(7, "Shochu", None))?;
        assert_eq!(create(&mut store, &mk_category(1, "Junmai", Some(1)))?, 8);

        let Some(created) = store.get_category(8)? else {
            panic!("category 8 should exist");
        };
        assert_eq!(created.name, "Junmai");
        assert_eq!(created.parent, Some(1));
        Ok(())
    }

    #[test]
    fn sibling_lookup_is_scoped_to_parent_and_excludes_self() -> Result<()> {
        let mut store = migrated_memory_store()?;
        seed(&mut store, &mk_category(1, "Sake", None))?;
        seed(&mut store, &mk_category(2, "Shochu", None))?;
        seed(&mut store, &mk_category(3, "Junmai", Some(1)))?;

        assert!(store.find_category_by_parent_and_name(Some(1), "Junmai", None)?.is_some());
        assert!(store.find_category_by_parent_and_name(Some(2), "Junmai", None)?.is_none());
        assert!(store.find_category_by_parent_and_name(Some(1), "junmai", None)?.is_none());
        assert!(store.find_category_by_parent_and_name(Some(1), "Junmai", Some(3))?.is_none());
        assert!(store.find_category_by_parent_and_name(None, "Shochu", None)?.is_some());
        Ok(())
    }

    #[test]
    fn update_logs_previous_state_before_replacing() -> Result<()> {
        let mut store = migrated_memory_store()?;
        seed(&mut store, &mk_category(1, "Sake", None))?;
        let previous = mk_category(2, "Junmai", Some(1));
        seed(&mut store, &previous)?;

        let mut record = previous.clone();
        record.name = "Junmai Ginjo".to_string();
        record.version_no = Some(2);
        let outcome =
            store.commit_category(CategoryCommit::Update { previous: &previous, record: &record })?;
        assert_eq!(outcome, CommitOutcome::Applied { id: 2 });

        assert_eq!(store.get_category(2)?, Some(record));
        let Some(entry) = store.get_log_by_version(2, 1)? else {
            panic!("version 1 should be logged");
        };
        assert_eq!(entry.snapshot, previous);
        assert_eq!(store.list_logs(2)?.len(), 1);
        Ok(())
    }

    #[test]
    fn stale_update_is_reported_and_writes_nothing() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let previous = mk_category(2, "Junmai", Some(1));
        seed(&mut store, &previous)?;

        let mut first = previous.clone();
        first.version_no = Some(2);
        store.commit_category(CategoryCommit::Update { previous: &previous, record: &first })?;

        let mut second = previous.clone();
        second.name = "Lost edit".to_string();
        second.version_no = Some(2);
        let outcome =
            store.commit_category(CategoryCommit::Update { previous: &previous, record: &second })?;

        assert_eq!(outcome, CommitOutcome::VersionConflict { stored: Some(2) });
        assert_eq!(store.get_category(2)?, Some(first));
        assert_eq!(log_count(&store)?, 1);
        Ok(())
    }

    #[test]
    fn update_of_missing_row_writes_nothing() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let previous = mk_category(9, "Ghost", Some(1));
        let outcome = store
            .commit_category(CategoryCommit::Update { previous: &previous, record: &previous })?;
        assert_eq!(outcome, CommitOutcome::Missing);
        assert_eq!(log_count(&store)?, 0);
        Ok(())
    }

    #[test]
    fn failed_log_insert_rolls_back_live_write() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let previous = mk_category(2, "Junmai", Some(1));
        seed(&mut store, &previous)?;
        // Occupy the (id, version_no) log slot so the log insert fails.
        store.conn.execute(
            "INSERT INTO categories_logs(id, name, version_no, updated_at, logged_at)
             VALUES (2, 'Junmai', 1, ?1, ?1)",
            params!["2026-01-01T00:00:00Z"],
        )?;

        let mut record = previous.clone();
        record.name = "Should not land".to_string();
        record.version_no = Some(2);
        let result =
            store.commit_category(CategoryCommit::Update { previous: &previous, record: &record });

        assert!(result.is_err());
        assert_eq!(store.get_category(2)?, Some(previous));
        assert_eq!(log_count(&store)?, 1);
        Ok(())
    }

    #[test]
    fn duplicate_sibling_insert_is_rejected_by_index() -> Result<()> {
        let mut store = migrated_memory_store()?;
        seed(&mut store, &mk_category(2, "Junmai", Some(1)))?;
        let duplicate = mk_category(3, "Junmai", Some(1));
        let result = create(&mut store, &duplicate);
        assert!(result.is_err());
        assert_eq!(store.list_categories()?.len(), 1);
        Ok(())
    }

    #[test]
    fn logs_are_listed_newest_first() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let mut current = mk_category(2, "Junmai", Some(1));
        seed(&mut store, &current)?;
        for version in 2..=4 {
            let mut next = current.clone();
            next.version_no = Some(version);
            next.description = Some(format!("edit {version}"));
            store.commit_category(CategoryCommit::Update { previous: &current, record: &next })?;
            current = next;
        }

        let versions =
            store.list_logs(2)?.iter().map(|entry| entry.snapshot.version_no).collect::<Vec<_>>();
        assert_eq!(versions, vec![Some(3), Some(2), Some(1)]);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_orphans_cycles_and_duplicates() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        for (id, name, parent) in [
            (1_i64, "Sake", None),
            (2, "Junmai", Some(1_i64)),
            (3, "Junmai", Some(1)),
            (4, "Stray", Some(99)),
            (5, "Loop A", Some(6)),
            (6, "Loop B", Some(5)),
        ] {
            store.conn.execute(
                "INSERT INTO categories(id, name, parent, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, parent, "2026-01-01T00:00:00Z"],
            )?;
        }

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(!report.is_clean());
        assert_eq!(report.orphaned_categories, vec![4]);
        assert_eq!(report.cyclic_categories, vec![5, 6]);
        assert_eq!(report.duplicate_sibling_names.len(), 1);
        assert_eq!(report.duplicate_sibling_names[0].count, 2);
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("sakelog-backup-{}", Ulid::new()));
        let db_path = dir.join("source.sqlite3");
        let backup_path = dir.join("backups/categories.sqlite3");
        fs::create_dir_all(&dir)?;

        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        seed(&mut store, &mk_category(1, "Sake", None))?;
        store.backup_database(&backup_path)?;

        seed(&mut store, &mk_category(2, "Junmai", Some(1)))?;
        store.restore_database(&backup_path)?;

        assert_eq!(store.list_categories()?.len(), 1);
        assert!(store.integrity_check()?.is_clean());

        drop(store);
        fs::remove_dir_all(&dir).with_context(|| format!("failed to cleanup {}", dir.display()))?;
        Ok(())
    }

    #[test]
    fn concurrent_creates_receive_distinct_ids() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("sakelog-create-race-{}.sqlite3", Ulid::new()));
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            seed(&mut init, &mk_category(1, "Sake", None))?;
        }

        let mut handles = Vec::new();
        for writer in 0..4 {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<CategoryId> {
                let mut store = SqliteStore::open(&path)?;
                create(&mut store, &mk_category(0, &format!("Brew {writer}"), Some(1)))
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            let Ok(id) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            ids.insert(id?);
        }
        assert_eq!(ids, BTreeSet::from([2, 3, 4, 5]));

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn concurrent_stale_updates_admit_exactly_one_writer() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("sakelog-concurrency-{}.sqlite3", Ulid::new()));
        let previous = mk_category(2, "Junmai", Some(1));
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            seed(&mut init, &previous)?;
        }

        let mut handles = Vec::new();
        for writer in 0..4 {
            let path = db_path.clone();
            let previous = previous.clone();
            handles.push(thread::spawn(move || -> Result<CommitOutcome> {
                let mut store = SqliteStore::open(&path)?;
                let mut record = previous.clone();
                record.description = Some(format!("writer {writer}"));
                record.version_no = Some(2);
                store.commit_category(CategoryCommit::Update {
                    previous: &previous,
                    record: &record,
                })
            }));
        }

        let mut applied = 0;
        for handle in handles {
            let Ok(outcome) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            match outcome? {
                CommitOutcome::Applied { id } => {
                    assert_eq!(id, 2);
                    applied += 1;
                }
                CommitOutcome::VersionConflict { stored } => assert_eq!(stored, Some(2)),
                CommitOutcome::Missing => panic!("row should exist"),
            }
        }
        assert_eq!(applied, 1);

        let store = SqliteStore::open(&db_path)?;
        assert_eq!(store.list_logs(2)?.len(), 1);
        drop(store);

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
