//! SQLite persistence layer for the logistics core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the transaction
//! helper every mutating operation goes through, and `local_settings`
//! helpers used by configuration.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{LogisticsError, Result};

/// Shared database handle. The connection is guarded by a mutex; callers must
/// not hold the guard across an `.await`.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LogisticsError::Database(format!("connection lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Open (or create) the database at `db_path`, apply pragmas and run any
/// pending migrations.
pub fn init(db_path: &Path) -> Result<DbState> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| LogisticsError::Database(format!("create data dir: {e}")))?;
    }

    info!("Opening database at {}", db_path.display());
    let conn = open_and_configure(db_path)?;
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// In-memory database with the full schema, for tests and tooling.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| LogisticsError::Database(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| LogisticsError::Database(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run `f` inside `BEGIN IMMEDIATE … COMMIT`. Any error rolls the whole
/// transaction back, so side effects of one call land together or not at all.
pub fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| LogisticsError::Database(format!("begin transaction: {e}")))?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                rollback(conn);
                return Err(LogisticsError::Database(format!("commit: {e}")));
            }
            Ok(value)
        }
        Err(e) => {
            rollback(conn);
            Err(e)
        }
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(error = %e, "Transaction rollback failed");
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| LogisticsError::Database(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        apply_migration(conn, 1, MIGRATION_V1)?;
    }
    if current < 2 {
        apply_migration(conn, 2, MIGRATION_V2)?;
    }
    if current < 3 {
        apply_migration(conn, 3, MIGRATION_V3)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32, sql: &str) -> Result<()> {
    let batch = format!(
        "BEGIN;
         {sql}
         INSERT INTO schema_version (version) VALUES ({version});
         COMMIT;"
    );
    conn.execute_batch(&batch).map_err(|e| {
        let _ = conn.execute_batch("ROLLBACK");
        error!("Migration v{version} failed: {e}");
        LogisticsError::Database(format!("migration v{version}: {e}"))
    })?;
    info!("Applied migration v{version}");
    Ok(())
}

/// v1: catalogue stock targets, orders, items, activity log, settings.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS local_settings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        setting_category TEXT NOT NULL,
        setting_key TEXT NOT NULL,
        setting_value TEXT NOT NULL,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now')),
        UNIQUE(setting_category, setting_key)
    );

    CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        sku TEXT,
        barcode TEXT,
        price REAL NOT NULL DEFAULT 0,
        stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
        stock_status TEXT NOT NULL DEFAULT 'in_stock'
            CHECK (stock_status IN ('in_stock', 'low_stock', 'out_of_stock')),
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS product_variations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id INTEGER NOT NULL,
        variation_name TEXT,
        sku TEXT NOT NULL UNIQUE,
        barcode TEXT,
        price REAL NOT NULL DEFAULT 0,
        stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'inactive', 'out_of_stock')),
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now')),
        FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_number TEXT NOT NULL UNIQUE,
        barcode TEXT,
        customer_name TEXT NOT NULL DEFAULT '',
        customer_phone TEXT NOT NULL DEFAULT '',
        alternate_phone TEXT,
        shipping_address TEXT NOT NULL DEFAULT '',
        branch_city TEXT,
        notes TEXT NOT NULL DEFAULT '',
        order_status TEXT NOT NULL DEFAULT 'processing'
            CHECK (order_status IN ('pending', 'processing', 'confirmed', 'packed', 'shipped',
                                    'dispatched', 'delivered', 'cancelled', 'returned')),
        payment_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (payment_status IN ('pending', 'partial', 'paid', 'failed', 'refunded')),
        courier_status TEXT,
        courier_order_id TEXT,
        courier_from_branch TEXT,
        courier_destination_branch TEXT,
        courier_created_at TEXT,
        courier_last_synced_at TEXT,
        tracking_number TEXT,
        admin_notes TEXT,
        logistics TEXT,
        in_out TEXT NOT NULL DEFAULT 'in' CHECK (in_out IN ('in', 'out')),
        is_partial_payment INTEGER NOT NULL DEFAULT 0,
        partial_amount_paid REAL,
        remaining_amount REAL,
        subtotal REAL NOT NULL DEFAULT 0,
        discount_amount REAL NOT NULL DEFAULT 0,
        shipping_charge REAL NOT NULL DEFAULT 0,
        tax_percent REAL NOT NULL DEFAULT 13,
        total_amount REAL NOT NULL DEFAULT 0,
        package_weight REAL,
        stock_deducted INTEGER NOT NULL DEFAULT 0,
        delivered_at TEXT,
        dispatch_date TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS order_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id INTEGER NOT NULL,
        product_id INTEGER,
        variation_id INTEGER,
        product_name TEXT NOT NULL DEFAULT '',
        product_sku TEXT,
        quantity INTEGER NOT NULL DEFAULT 1 CHECK (quantity > 0),
        price REAL NOT NULL DEFAULT 0,
        total REAL NOT NULL DEFAULT 0,
        created_at TEXT DEFAULT (datetime('now')),
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE,
        FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE SET NULL,
        FOREIGN KEY(variation_id) REFERENCES product_variations(id) ON DELETE SET NULL
    );

    CREATE TABLE IF NOT EXISTS order_activity_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id INTEGER NOT NULL,
        action_type TEXT NOT NULL
            CHECK (action_type IN ('created', 'status_changed', 'payment_changed',
                                   'tracking_added', 'tracking_updated', 'notes_added',
                                   'notes_updated', 'updated', 'city_detected',
                                   'deleted', 'restored')),
        field_name TEXT NOT NULL DEFAULT '',
        old_value TEXT NOT NULL DEFAULT '',
        new_value TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        actor TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(order_id) REFERENCES orders(id)
    );

    CREATE TRIGGER IF NOT EXISTS trg_activity_logs_no_update
    BEFORE UPDATE ON order_activity_logs
    BEGIN
        SELECT RAISE(ABORT, 'order_activity_logs is append-only');
    END;

    CREATE TRIGGER IF NOT EXISTS trg_activity_logs_no_delete
    BEFORE DELETE ON order_activity_logs
    BEGIN
        SELECT RAISE(ABORT, 'order_activity_logs is append-only');
    END;

    CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(order_status);
    CREATE INDEX IF NOT EXISTS idx_orders_barcode ON orders(barcode);
    CREATE INDEX IF NOT EXISTS idx_orders_is_deleted ON orders(is_deleted);
    CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);
    CREATE INDEX IF NOT EXISTS idx_activity_logs_order_id ON order_activity_logs(order_id);
";

/// v2: dispatch batches.
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS dispatches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_number TEXT NOT NULL UNIQUE,
        logistics TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'dispatched',
        total_orders INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        created_by TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_by TEXT,
        deleted_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS dispatch_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dispatch_id INTEGER NOT NULL,
        scanned_order_id TEXT NOT NULL,
        order_id INTEGER,
        scanned_at TEXT NOT NULL,
        FOREIGN KEY(dispatch_id) REFERENCES dispatches(id) ON DELETE CASCADE,
        FOREIGN KEY(order_id) REFERENCES orders(id)
    );

    CREATE TRIGGER IF NOT EXISTS trg_dispatch_items_immutable
    BEFORE UPDATE ON dispatch_items
    BEGIN
        SELECT RAISE(ABORT, 'dispatch_items are immutable');
    END;

    CREATE INDEX IF NOT EXISTS idx_dispatches_created_at ON dispatches(created_at);
    CREATE INDEX IF NOT EXISTS idx_dispatches_is_deleted ON dispatches(is_deleted);
    CREATE INDEX IF NOT EXISTS idx_dispatch_items_dispatch_id ON dispatch_items(dispatch_id);
    CREATE INDEX IF NOT EXISTS idx_dispatch_items_scanned ON dispatch_items(scanned_order_id);
";

/// v3: courier linkage guard (send claim, unique + immutable shipment id).
const MIGRATION_V3: &str = "
    ALTER TABLE orders ADD COLUMN courier_send_claim TEXT;
    ALTER TABLE orders ADD COLUMN courier_send_claimed_at TEXT;

    CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_courier_order_id
        ON orders(courier_order_id) WHERE courier_order_id IS NOT NULL;

    CREATE TRIGGER IF NOT EXISTS trg_orders_courier_order_id_immutable
    BEFORE UPDATE OF courier_order_id ON orders
    WHEN OLD.courier_order_id IS NOT NULL
         AND (NEW.courier_order_id IS NULL OR NEW.courier_order_id <> OLD.courier_order_id)
    BEGIN
        SELECT RAISE(ABORT, 'courier_order_id is immutable once set');
    END;
";

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| LogisticsError::Database(format!("set_setting: {e}")))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn insert_order(conn: &Connection, number: &str) -> i64 {
        conn.execute(
            "INSERT INTO orders (order_number, created_at, updated_at)
             VALUES (?1, datetime('now'), datetime('now'))",
            params![number],
        )
        .expect("insert order");
        conn.last_insert_rowid()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let tables = table_names(&conn);
        for expected in [
            "dispatch_items",
            "dispatches",
            "local_settings",
            "order_activity_logs",
            "order_items",
            "orders",
            "product_variations",
            "products",
            "schema_version",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("logistics.db");
        let db = init(&db_path).expect("init file db");
        let conn = db.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();

        let result: Result<()> = in_transaction(&conn, |conn| {
            insert_order(conn, "ORD000001");
            Err(LogisticsError::validation("boom"))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_failed_rollback_keeps_original_error() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();

        // closure ends the transaction itself, so the rollback has nothing to undo
        let result: Result<()> = in_transaction(&conn, |conn| {
            conn.execute_batch("COMMIT").unwrap();
            Err(LogisticsError::validation("boom"))
        });
        assert!(matches!(result, Err(LogisticsError::Validation(ref m)) if m == "boom"));
        assert!(conn.is_autocommit());

        // connection is still usable for the next transaction
        in_transaction(&conn, |conn| Ok(insert_order(conn, "ORD000001"))).unwrap();
    }

    #[test]
    fn test_transaction_commits_on_success() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let id = in_transaction(&conn, |conn| Ok(insert_order(conn, "ORD000001"))).unwrap();
        assert!(id > 0);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_courier_order_id_cannot_be_overwritten() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let id = insert_order(&conn, "ORD000001");
        conn.execute(
            "UPDATE orders SET courier_order_id = '99' WHERE id = ?1",
            params![id],
        )
        .unwrap();

        let err: LogisticsError = conn
            .execute(
                "UPDATE orders SET courier_order_id = '100' WHERE id = ?1",
                params![id],
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, LogisticsError::ConcurrencyConflict(_)));

        let err: LogisticsError = conn
            .execute(
                "UPDATE orders SET courier_order_id = NULL WHERE id = ?1",
                params![id],
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, LogisticsError::ConcurrencyConflict(_)));
    }

    #[test]
    fn test_courier_order_id_is_unique_across_orders() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let a = insert_order(&conn, "ORD000001");
        let b = insert_order(&conn, "ORD000002");
        conn.execute(
            "UPDATE orders SET courier_order_id = '99' WHERE id = ?1",
            params![a],
        )
        .unwrap();
        let err: LogisticsError = conn
            .execute(
                "UPDATE orders SET courier_order_id = '99' WHERE id = ?1",
                params![b],
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, LogisticsError::ConcurrencyConflict(_)));
    }

    #[test]
    fn test_activity_log_is_append_only() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let id = insert_order(&conn, "ORD000001");
        conn.execute(
            "INSERT INTO order_activity_logs (order_id, action_type, created_at)
             VALUES (?1, 'created', datetime('now'))",
            params![id],
        )
        .unwrap();
        assert!(conn
            .execute("UPDATE order_activity_logs SET description = 'x'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM order_activity_logs", []).is_err());
    }

    #[test]
    fn test_settings_crud() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().unwrap();

        set_setting(&conn, "courier", "from_branch", "TINKUNE").expect("set");
        assert_eq!(
            get_setting(&conn, "courier", "from_branch"),
            Some("TINKUNE".to_string())
        );

        set_setting(&conn, "courier", "from_branch", "POKHARA").expect("update");
        assert_eq!(
            get_setting(&conn, "courier", "from_branch"),
            Some("POKHARA".to_string())
        );
        assert!(get_setting(&conn, "courier", "missing").is_none());
    }
}
