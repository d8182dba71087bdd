use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS resources (
  id INTEGER PRIMARY KEY,
  kind TEXT NOT NULL,
  name TEXT NOT NULL DEFAULT '',
  namespace TEXT NOT NULL DEFAULT '',
  data JSON NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS resources_identity_idx ON resources (kind, name, namespace);
CREATE INDEX IF NOT EXISTS resources_namespace_idx ON resources (namespace);

CREATE TABLE IF NOT EXISTS instantiations (
  id INTEGER PRIMARY KEY,
  rule_num INTEGER NOT NULL,
  priority INTEGER NOT NULL DEFAULT 0,
  timestamp INTEGER,
  active BOOL NOT NULL DEFAULT TRUE,
  resources JSON NOT NULL
);

CREATE TABLE IF NOT EXISTS resource_instantiations (
  resource_id INTEGER NOT NULL,
  instantiation_id INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS resource_instantiations_resource_idx
  ON resource_instantiations (resource_id);
CREATE INDEX IF NOT EXISTS resource_instantiations_pair_idx
  ON resource_instantiations (instantiation_id, resource_id);

CREATE TRIGGER IF NOT EXISTS instantiation_timestamp_trigger
AFTER INSERT ON instantiations
BEGIN
  UPDATE instantiations SET timestamp = unixepoch('now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS instantiation_link_trigger
AFTER INSERT ON instantiations
BEGIN
  INSERT INTO resource_instantiations
    SELECT value, NEW.id FROM json_each(NEW.resources);
END;

CREATE TRIGGER IF NOT EXISTS instantiation_unlink_trigger
AFTER DELETE ON instantiations
BEGIN
  DELETE FROM resource_instantiations WHERE instantiation_id = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS resource_rewrite_trigger
BEFORE UPDATE ON resources
BEGIN
  DELETE FROM instantiations WHERE id IN
    (SELECT instantiation_id FROM resource_instantiations WHERE resource_id = NEW.id);
  DELETE FROM resource_instantiations WHERE resource_id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS resource_removal_trigger
AFTER DELETE ON resources
BEGIN
  DELETE FROM instantiations WHERE id IN
    (SELECT instantiation_id FROM resource_instantiations WHERE resource_id = OLD.id);
  DELETE FROM resource_instantiations WHERE resource_id = OLD.id;
END;
";

const UPSERT_RESOURCE_SQL: &str = "INSERT INTO resources (kind, name, namespace, data) \
     VALUES (?1, ?2, ?3, ?4) \
     ON CONFLICT (kind, name, namespace) DO UPDATE SET data = excluded.data";

/// The unique identity of a resource in working memory.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceKey {
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: namespace.into() }
    }
}

/// An instantiation selected for firing: its row ID, owning rule index, and
/// the bound resource IDs in LHS match order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingInstantiation {
    pub id: i64,
    pub rule_num: usize,
    pub resources: Vec<i64>,
}

/// Result of probing the working-memory invariants.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Link rows whose instantiation or resource no longer exists.
    pub orphan_links: Vec<(i64, i64)>,
    /// Instantiations whose resource tuple is not exactly mirrored by the
    /// link table.
    pub mismatched_instantiations: Vec<i64>,
    /// Instantiations referencing resource IDs that do not exist.
    pub dangling_instantiations: Vec<i64>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok
            && self.orphan_links.is_empty()
            && self.mismatched_instantiations.is_empty()
            && self.dangling_instantiations.is_empty()
    }
}

/// SQLite-backed working memory: resources, instantiations, and the link rows
/// tying them together.
///
/// The maintenance triggers installed by [`Store::open`] guarantee that no
/// instantiation survives a write to any resource it depends on.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open working memory at `path`, or in memory when `path` is `None`, and
    /// install the schema and maintenance triggers.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)
                .with_context(|| format!("failed to open sqlite database at {}", path.display()))?,
            None => Connection::open_in_memory().context("failed to open in-memory database")?,
        };

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(SCHEMA_SQL).context("failed to apply working-memory schema")?;

        Ok(Self { conn })
    }

    /// Execute a batch of compiled statements (trigger DDL and instantiation
    /// predicates) in a single transaction.
    ///
    /// # Errors
    /// Returns an error when any statement fails; the whole batch rolls back.
    pub fn apply_batch(&mut self, statements: &[String]) -> Result<()> {
        let tx =
            self.conn.transaction().context("failed to start registration transaction")?;

        for sql in statements {
            tracing::debug!("applying compiled statement: {sql}");
            tx.execute_batch(sql)
                .with_context(|| format!("failed to apply compiled statement: {sql}"))?;
        }

        tx.commit().context("failed to commit registration transaction")
    }

    /// Upsert a batch of resources in one transaction. Replacing an existing
    /// resource destroys its dependent instantiations before the new data is
    /// written; the per-rule triggers then re-evaluate against the new data.
    ///
    /// # Errors
    /// Returns an error when any write fails; the whole batch rolls back.
    pub fn upsert_resources(&mut self, records: &[(ResourceKey, String)]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start resource transaction")?;

        for (key, data) in records {
            upsert_resource(&tx, key, data)?;
        }

        tx.commit().context("failed to commit resource batch")
    }

    /// Read a resource's JSON payload by its identity triple.
    ///
    /// # Errors
    /// Returns an error when the lookup itself fails.
    pub fn resource_data(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT data FROM resources \
                 WHERE kind = ?1 AND name = ?2 AND namespace = ?3",
                params![kind, name, namespace],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read resource")
    }

    /// Delete a resource by identity; dependent instantiations cascade.
    /// Returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_resource(&mut self, kind: &str, name: &str, namespace: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM resources WHERE kind = ?1 AND name = ?2 AND namespace = ?3",
                params![kind, name, namespace],
            )
            .context("failed to delete resource")?;

        Ok(changed > 0)
    }

    /// Begin a firing transaction. Dropping the transaction without committing
    /// rolls it back.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn.transaction().context("failed to start transaction")
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn resource_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))
            .context("failed to count resources")
    }

    /// Size of the conflict set: the number of live instantiations.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn instantiation_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM instantiations", [], |row| row.get(0))
            .context("failed to count instantiations")
    }

    /// The live conflict set in firing order: lowest priority value first,
    /// then oldest timestamp, then smallest ID.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read or decoded.
    pub fn pending_instantiations(&self) -> Result<Vec<PendingInstantiation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, rule_num, resources FROM instantiations \
                 ORDER BY priority ASC, timestamp ASC, id ASC",
            )
            .context("failed to prepare conflict-set query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })
            .context("failed to read conflict set")?;

        let mut pending = Vec::new();
        for row in rows {
            let (id, rule_num, resources) = row.context("failed to decode instantiation row")?;
            pending.push(decode_pending(id, rule_num, &resources)?);
        }

        Ok(pending)
    }

    /// All `(resource_id, instantiation_id)` link rows, in insertion order.
    ///
    /// # Errors
    /// Returns an error when the link rows cannot be read.
    pub fn link_rows(&self) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT resource_id, instantiation_id FROM resource_instantiations")
            .context("failed to prepare link query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("failed to read link rows")?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row.context("failed to decode link row")?);
        }

        Ok(links)
    }

    /// Probe the file-level and relational invariants of working memory: the
    /// link table must be exactly the expansion of every live instantiation's
    /// resource tuple, and every referenced resource must exist.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run PRAGMA quick_check")?;

        let orphan_links = self.collect_pairs(
            "SELECT ri.resource_id, ri.instantiation_id FROM resource_instantiations ri \
             WHERE NOT EXISTS (SELECT 1 FROM instantiations i WHERE i.id = ri.instantiation_id) \
                OR NOT EXISTS (SELECT 1 FROM resources r WHERE r.id = ri.resource_id)",
        )?;

        let mismatched_instantiations = self.collect_ids(
            "SELECT i.id FROM instantiations i \
             WHERE EXISTS (SELECT 1 FROM json_each(i.resources) je \
                           WHERE NOT EXISTS (SELECT 1 FROM resource_instantiations ri \
                                             WHERE ri.instantiation_id = i.id \
                                               AND ri.resource_id = je.value)) \
                OR (SELECT COUNT(*) FROM json_each(i.resources)) <> \
                   (SELECT COUNT(*) FROM resource_instantiations ri \
                    WHERE ri.instantiation_id = i.id)",
        )?;

        let dangling_instantiations = self.collect_ids(
            "SELECT DISTINCT i.id FROM instantiations i, json_each(i.resources) je \
             WHERE NOT EXISTS (SELECT 1 FROM resources r WHERE r.id = je.value)",
        )?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            orphan_links,
            mismatched_instantiations,
            dangling_instantiations,
        })
    }

    fn collect_pairs(&self, sql: &str) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare integrity probe")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("failed to run integrity probe")?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row.context("failed to decode integrity probe row")?);
        }

        Ok(pairs)
    }

    fn collect_ids(&self, sql: &str) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare integrity probe")?;
        let rows =
            stmt.query_map([], |row| row.get(0)).context("failed to run integrity probe")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("failed to decode integrity probe row")?);
        }

        Ok(ids)
    }
}

/// Upsert one resource inside an existing transaction.
///
/// # Errors
/// Returns an error when the write fails.
pub fn upsert_resource(tx: &Transaction<'_>, key: &ResourceKey, data: &str) -> Result<()> {
    tx.execute(UPSERT_RESOURCE_SQL, params![key.kind, key.name, key.namespace, data])
        .with_context(|| {
            format!("failed to upsert resource {}/{}/{}", key.kind, key.namespace, key.name)
        })?;

    Ok(())
}

/// Select the next instantiation to fire: lowest priority value first, then
/// oldest timestamp, then smallest ID.
///
/// # Errors
/// Returns an error when the selection query fails or the stored resource
/// tuple cannot be decoded.
pub fn next_instantiation(tx: &Transaction<'_>) -> Result<Option<PendingInstantiation>> {
    let row = tx
        .query_row(
            "SELECT id, rule_num, resources FROM instantiations \
             ORDER BY priority ASC, timestamp ASC, id ASC LIMIT 1",
            [],
            |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            },
        )
        .optional()
        .context("failed to select next instantiation")?;

    let Some((id, rule_num, resources)) = row else {
        return Ok(None);
    };

    Ok(Some(decode_pending(id, rule_num, &resources)?))
}

fn decode_pending(id: i64, rule_num: i64, resources: &str) -> Result<PendingInstantiation> {
    let rule_num = usize::try_from(rule_num)
        .with_context(|| format!("instantiation {id} has negative rule index {rule_num}"))?;
    let resources: Vec<i64> = serde_json::from_str(resources)
        .with_context(|| format!("instantiation {id} has a malformed resource tuple"))?;

    Ok(PendingInstantiation { id, rule_num, resources })
}

/// Delete one instantiation by ID; its link rows cascade.
///
/// # Errors
/// Returns an error when the delete fails.
pub fn delete_instantiation(tx: &Transaction<'_>, id: i64) -> Result<()> {
    tx.execute("DELETE FROM instantiations WHERE id = ?1", params![id])
        .with_context(|| format!("failed to delete instantiation {id}"))?;

    Ok(())
}
