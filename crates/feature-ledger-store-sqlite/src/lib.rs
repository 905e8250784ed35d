use std::path::Path;

use anyhow::{anyhow, Context, Result};
use feature_ledger_core::{Cart, CartDraft, CustomFieldRaw, CustomObject, SetCustomType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CART_STATE_ACTIVE: &str = "Active";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS carts (
  cart_id TEXT PRIMARY KEY,
  version INTEGER NOT NULL CHECK (version >= 1),
  currency TEXT NOT NULL,
  country TEXT,
  shipping_country TEXT,
  cart_state TEXT NOT NULL CHECK (cart_state IN ('Active','Merged','Ordered','Frozen')),
  created_at TEXT NOT NULL,
  last_modified_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS custom_objects (
  id TEXT PRIMARY KEY,
  container TEXT NOT NULL,
  key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(container, key)
);

CREATE INDEX IF NOT EXISTS idx_carts_state_created_at ON carts(cart_state, created_at);
CREATE INDEX IF NOT EXISTS idx_custom_objects_container ON custom_objects(container);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE carts ADD COLUMN custom_type_key TEXT;

CREATE TABLE IF NOT EXISTS cart_custom_fields (
  cart_id TEXT NOT NULL,
  name TEXT NOT NULL,
  value_json TEXT NOT NULL,
  PRIMARY KEY (cart_id, name),
  FOREIGN KEY (cart_id) REFERENCES carts(cart_id)
);
";

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
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed cart store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
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
        if !table_exists(&self.conn, "carts")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "carts", "custom_type_key")? {
            // Tables already carry custom fields but the migration log was lost.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "carts", "custom_type_key")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Create a new active cart from the draft.
    ///
    /// # Errors
    /// Returns an error when the cart cannot be persisted.
    pub fn create_cart(&mut self, draft: &CartDraft) -> Result<Cart> {
        let cart_id = Ulid::new().to_string();
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO carts(
                    cart_id, version, currency, country, shipping_country,
                    cart_state, created_at, last_modified_at, custom_type_key
                ) VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?6, NULL)",
                params![
                    cart_id,
                    draft.currency,
                    draft.country,
                    draft.shipping_address.country,
                    CART_STATE_ACTIVE,
                    now,
                ],
            )
            .context("failed to insert cart")?;

        self.get_cart(&cart_id)?
            .ok_or_else(|| anyhow!("cart disappeared right after creation: {cart_id}"))
    }

    /// Most recently created cart still in the `Active` state.
    ///
    /// # Errors
    /// Returns an error when the cart or its custom fields cannot be read.
    pub fn active_cart(&self) -> Result<Option<Cart>> {
        let cart_id = self
            .conn
            .query_row(
                "SELECT cart_id FROM carts
                 WHERE cart_state = ?1
                 ORDER BY rowid DESC
                 LIMIT 1",
                params![CART_STATE_ACTIVE],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up active cart")?;

        match cart_id {
            Some(cart_id) => self.get_cart(&cart_id),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the cart row or its custom fields cannot be decoded.
    pub fn get_cart(&self, cart_id: &str) -> Result<Option<Cart>> {
        let row = self
            .conn
            .query_row(
                "SELECT cart_id, version, currency, country, custom_type_key
                 FROM carts WHERE cart_id = ?1",
                params![cart_id],
                cart_from_row,
            )
            .optional()
            .with_context(|| format!("failed to read cart {cart_id}"))?;

        let Some(mut cart) = row else {
            return Ok(None);
        };
        cart.custom_fields_raw = self.cart_custom_fields(cart_id)?;
        Ok(Some(cart))
    }

    fn cart_custom_fields(&self, cart_id: &str) -> Result<Vec<CustomFieldRaw>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, value_json FROM cart_custom_fields
             WHERE cart_id = ?1
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![cart_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut fields = Vec::new();
        for row in rows {
            let (name, value_json) = row?;
            let value = serde_json::from_str(&value_json).with_context(|| {
                format!("invalid stored value for custom field {name} on cart {cart_id}")
            })?;
            fields.push(CustomFieldRaw { name, value });
        }
        Ok(fields)
    }

    /// Replace the cart's custom type and fields, bumping the cart version.
    ///
    /// A field value holding a JSON array or object in string form is stored as that document.
    /// Every other value, scalars like `"42"` or `"true"` included, is stored as a string.
    ///
    /// # Errors
    /// Returns an error when the cart does not exist or the update cannot be committed.
    pub fn set_custom_type(&mut self, cart_id: &str, action: &SetCustomType) -> Result<Cart> {
        let value = stored_field_value(&action.fields.value);
        let now = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start cart update transaction")?;
        let updated = tx
            .execute(
                "UPDATE carts
                 SET custom_type_key = ?2, version = version + 1, last_modified_at = ?3
                 WHERE cart_id = ?1",
                params![cart_id, action.type_ref.key, now],
            )
            .with_context(|| format!("failed to update cart {cart_id}"))?;
        if updated == 0 {
            return Err(anyhow!("cart not found: {cart_id}"));
        }

        tx.execute("DELETE FROM cart_custom_fields WHERE cart_id = ?1", params![cart_id])
            .context("failed to clear cart custom fields")?;
        tx.execute(
            "INSERT INTO cart_custom_fields(cart_id, name, value_json) VALUES (?1, ?2, ?3)",
            params![
                cart_id,
                action.fields.name,
                serde_json::to_string(&value).context("failed to serialize custom field value")?,
            ],
        )
        .context("failed to insert cart custom field")?;
        tx.commit().context("failed to commit cart update transaction")?;

        self.get_cart(cart_id)?.ok_or_else(|| anyhow!("cart not found after update: {cart_id}"))
    }

    /// Insert a custom object, or replace the value of the one already stored under
    /// `(container, key)`. The existing id is kept on replace.
    ///
    /// # Errors
    /// Returns an error when the value cannot be serialized or persisted.
    pub fn upsert_custom_object(
        &mut self,
        container: &str,
        key: &str,
        value: &Value,
        id: Option<&str>,
    ) -> Result<CustomObject> {
        let value_json = serde_json::to_string(value).context("failed to serialize custom object")?;
        let tx = self.conn.transaction().context("failed to start custom object transaction")?;

        let existing_id = tx
            .query_row(
                "SELECT id FROM custom_objects WHERE container = ?1 AND key = ?2",
                params![container, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let object_id = match existing_id {
            Some(existing_id) => {
                tx.execute(
                    "UPDATE custom_objects SET value_json = ?2 WHERE id = ?1",
                    params![existing_id, value_json],
                )
                .context("failed to update custom object")?;
                existing_id
            }
            None => {
                let new_id = id.map_or_else(|| Ulid::new().to_string(), ToString::to_string);
                tx.execute(
                    "INSERT INTO custom_objects(id, container, key, value_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![new_id, container, key, value_json, now_rfc3339()?],
                )
                .with_context(|| format!("failed to insert custom object {container}/{key}"))?;
                new_id
            }
        };
        tx.commit().context("failed to commit custom object transaction")?;

        Ok(CustomObject {
            container: container.to_string(),
            key: key.to_string(),
            value: value.clone(),
            id: object_id,
        })
    }

    /// Custom objects of one container, in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or stored values are not JSON.
    pub fn custom_objects(&self, container: &str) -> Result<Vec<CustomObject>> {
        let mut stmt = self.conn.prepare(
            "SELECT container, key, value_json, id FROM custom_objects
             WHERE container = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![container], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut objects = Vec::new();
        for row in rows {
            let (container, key, value_json, id) = row?;
            let value = serde_json::from_str(&value_json)
                .with_context(|| format!("invalid stored value for custom object {id}"))?;
            objects.push(CustomObject { container, key, value, id });
        }
        Ok(objects)
    }

    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_custom_object(&mut self, container: &str, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM custom_objects WHERE container = ?1 AND key = ?2",
                params![container, key],
            )
            .with_context(|| format!("failed to delete custom object {container}/{key}"))?;
        Ok(deleted > 0)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn cart_from_row(row: &Row<'_>) -> rusqlite::Result<Cart> {
    Ok(Cart {
        id: row.get(0)?,
        version: row.get(1)?,
        currency: row.get(2)?,
        country: row.get(3)?,
        custom_type_key: row.get(4)?,
        custom_fields_raw: Vec::new(),
    })
}

fn stored_field_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Array(_) | Value::Object(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
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

    if !table_exists(conn, "carts")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "carts", "custom_type_key")? {
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
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
