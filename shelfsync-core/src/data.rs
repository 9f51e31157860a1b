use crate::refresh::{CatalogStore, EntitySetKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::Decimal;
use shelfsync_scanner::result::{
    CategoryNode, CrawlOutcome, Currency, NavigationHeading, Price, ProductRecord, Record,
    RecordKind,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("could not encode product specs: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog connection lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// SQLite-backed catalog of normalized records, keyed by record identity.
pub struct Database {
    conn: Mutex<Connection>,
}

fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {} out of range", millis).into(),
        )
    })
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

impl Database {
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn drop(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;  -- 16MB cache
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CatalogError::Poisoned)
    }

    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "
            -- One row per crawl session
            CREATE TABLE IF NOT EXISTS crawl_sessions (
    id TEXT PRIMARY KEY,
    set_root TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('navigation', 'category', 'product')),
    finished_at INTEGER NOT NULL,
    pages_ok INTEGER NOT NULL,
    pages_failed INTEGER NOT NULL,
    records INTEGER NOT NULL,
    budget_exhausted BOOLEAN NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS navigation_headings (
    set_root TEXT NOT NULL,
    slug TEXT NOT NULL,
    title TEXT NOT NULL,
    source_url TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    PRIMARY KEY (set_root, slug)
);

-- parent_slug is '' for top-level categories so the key stays unique
CREATE TABLE IF NOT EXISTS categories (
    set_root TEXT NOT NULL,
    parent_slug TEXT NOT NULL DEFAULT '',
    slug TEXT NOT NULL,
    title TEXT NOT NULL,
    source_url TEXT NOT NULL,
    item_count INTEGER,
    acquired_at INTEGER NOT NULL,
    PRIMARY KEY (set_root, parent_slug, slug)
);

CREATE TABLE IF NOT EXISTS products (
    identity TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    title TEXT NOT NULL,
    author TEXT,
    price_amount TEXT,
    price_currency TEXT,
    image_url TEXT,
    proxied_image_url TEXT,
    source_url TEXT,
    available BOOLEAN NOT NULL DEFAULT 1,
    acquired_at INTEGER NOT NULL,
    specs TEXT NOT NULL DEFAULT '{}'  -- JSON object
);

-- A product can be listed under several roots; each root keeps its own membership.
CREATE TABLE IF NOT EXISTS product_sets (
    set_root TEXT NOT NULL,
    identity TEXT NOT NULL REFERENCES products(identity) ON DELETE CASCADE,
    acquired_at INTEGER NOT NULL,
    PRIMARY KEY (set_root, identity)
);

CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(set_root, parent_slug);
CREATE INDEX IF NOT EXISTS idx_sessions_root ON crawl_sessions(set_root, kind);
            ",
        )?;
        Ok(())
    }

    /// Insert or update records for one entity set in a single transaction.
    /// Existing rows with the same identity are updated in place.
    pub fn upsert_records(&self, root: &str, records: &[Record]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for record in records {
            match record {
                Record::Navigation(heading) => {
                    tx.execute(
                        "INSERT INTO navigation_headings (set_root, slug, title, source_url, acquired_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(set_root, slug) DO UPDATE SET
                            title = excluded.title,
                            source_url = excluded.source_url,
                            acquired_at = excluded.acquired_at",
                        params![
                            root,
                            &heading.slug,
                            &heading.title,
                            &heading.source_url,
                            to_millis(&heading.acquired_at),
                        ],
                    )?;
                }
                Record::Category(category) => {
                    tx.execute(
                        "INSERT INTO categories (set_root, parent_slug, slug, title, source_url, item_count, acquired_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(set_root, parent_slug, slug) DO UPDATE SET
                            title = excluded.title,
                            source_url = excluded.source_url,
                            item_count = excluded.item_count,
                            acquired_at = excluded.acquired_at",
                        params![
                            root,
                            category.parent_slug.as_deref().unwrap_or(""),
                            &category.slug,
                            &category.title,
                            &category.source_url,
                            category.item_count,
                            to_millis(&category.acquired_at),
                        ],
                    )?;
                }
                Record::Product(product) => {
                    let identity = product.identity();
                    let acquired_at = to_millis(&product.acquired_at);
                    let specs = serde_json::to_string(&product.specs)?;
                    tx.execute(
                        "INSERT INTO products (
                            identity, id, title, author, price_amount, price_currency,
                            image_url, proxied_image_url, source_url, available, acquired_at, specs
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                         ON CONFLICT(identity) DO UPDATE SET
                            id = excluded.id,
                            title = excluded.title,
                            author = excluded.author,
                            price_amount = excluded.price_amount,
                            price_currency = excluded.price_currency,
                            image_url = excluded.image_url,
                            proxied_image_url = excluded.proxied_image_url,
                            source_url = excluded.source_url,
                            available = excluded.available,
                            acquired_at = excluded.acquired_at,
                            specs = excluded.specs",
                        params![
                            identity,
                            &product.id,
                            &product.title,
                            &product.author,
                            product.price.as_ref().map(|p| p.amount.to_string()),
                            product.price.as_ref().map(|p| p.currency.code()),
                            &product.image_url,
                            &product.proxied_image_url,
                            &product.source_url,
                            product.available,
                            acquired_at,
                            specs,
                        ],
                    )?;
                    tx.execute(
                        "INSERT INTO product_sets (set_root, identity, acquired_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(set_root, identity) DO UPDATE SET
                            acquired_at = excluded.acquired_at",
                        params![root, identity, acquired_at],
                    )?;
                }
            }
        }

        tx.commit()?;
        debug!("Upserted {} record(s) for {}", records.len(), root);
        Ok(records.len())
    }

    pub fn load_records(&self, kind: RecordKind, root: &str) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let records = match kind {
            RecordKind::Navigation => {
                let mut stmt = conn.prepare(
                    "SELECT title, slug, source_url, acquired_at FROM navigation_headings
                     WHERE set_root = ?1 ORDER BY rowid",
                )?;
                stmt.query_map(params![root], |row| {
                    Ok(Record::Navigation(NavigationHeading {
                        title: row.get(0)?,
                        slug: row.get(1)?,
                        source_url: row.get(2)?,
                        acquired_at: from_millis(3, row.get(3)?)?,
                    }))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
            RecordKind::Category => {
                let mut stmt = conn.prepare(
                    "SELECT title, slug, parent_slug, source_url, item_count, acquired_at FROM categories
                     WHERE set_root = ?1 ORDER BY parent_slug, rowid",
                )?;
                stmt.query_map(params![root], |row| {
                    let parent: String = row.get(2)?;
                    Ok(Record::Category(CategoryNode {
                        title: row.get(0)?,
                        slug: row.get(1)?,
                        parent_slug: (!parent.is_empty()).then_some(parent),
                        source_url: row.get(3)?,
                        item_count: row.get(4)?,
                        acquired_at: from_millis(5, row.get(5)?)?,
                    }))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
            RecordKind::Product => {
                let mut stmt = conn.prepare(
                    "SELECT p.id, p.title, p.author, p.price_amount, p.price_currency, p.image_url,
                            p.proxied_image_url, p.source_url, p.available, m.acquired_at, p.specs
                     FROM product_sets m JOIN products p ON p.identity = m.identity
                     WHERE m.set_root = ?1 ORDER BY m.rowid",
                )?;
                stmt.query_map(params![root], product_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    /// Most recent acquisition time in an entity set, if it has any rows.
    pub fn newest_acquired(&self, kind: RecordKind, root: &str) -> Result<Option<DateTime<Utc>>> {
        let table = match kind {
            RecordKind::Navigation => "navigation_headings",
            RecordKind::Category => "categories",
            RecordKind::Product => "product_sets",
        };
        let conn = self.lock()?;
        let newest: Option<i64> = conn
            .query_row(
                &format!("SELECT MAX(acquired_at) FROM {} WHERE set_root = ?1", table),
                params![root],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        newest.map(|millis| from_millis(0, millis)).transpose().map_err(Into::into)
    }

    pub fn record_session(&self, root: &str, kind: RecordKind, outcome: &CrawlOutcome) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO crawl_sessions (
                id, set_root, kind, finished_at, pages_ok, pages_failed, records, budget_exhausted
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &outcome.session_id,
                root,
                kind.as_str(),
                Utc::now().timestamp_millis(),
                outcome.pages_succeeded() as i64,
                outcome.pages_failed() as i64,
                outcome.records.len() as i64,
                outcome.budget_exhausted,
            ],
        )?;
        Ok(())
    }

    /// (session id, root, kind, records) for recent sessions, newest first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<(String, String, String, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, set_root, kind, records FROM crawl_sessions
             ORDER BY finished_at DESC LIMIT ?1",
        )?;
        let sessions = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let amount: Option<String> = row.get(3)?;
    let currency: Option<String> = row.get(4)?;
    let price = match (amount, currency) {
        (Some(amount), Some(code)) => {
            let amount = Decimal::from_str(&amount).map_err(|e| conversion_error(3, e))?;
            Currency::from_code(&code).map(|currency| Price { amount, currency })
        }
        _ => None,
    };
    let specs: String = row.get(10)?;
    let specs: BTreeMap<String, String> =
        serde_json::from_str(&specs).map_err(|e| conversion_error(10, e))?;

    Ok(Record::Product(ProductRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        price,
        image_url: row.get(5)?,
        proxied_image_url: row.get(6)?,
        source_url: row.get(7)?,
        available: row.get(8)?,
        acquired_at: from_millis(9, row.get(9)?)?,
        specs,
    }))
}

#[async_trait]
impl CatalogStore for Database {
    async fn load(&self, key: &EntitySetKey) -> Result<Vec<Record>> {
        self.load_records(key.kind, &key.root)
    }

    async fn upsert(&self, key: &EntitySetKey, records: &[Record]) -> Result<usize> {
        self.upsert_records(&key.root, records)
    }

    async fn newest(&self, key: &EntitySetKey) -> Result<Option<DateTime<Utc>>> {
        self.newest_acquired(key.kind, &key.root)
    }
}
