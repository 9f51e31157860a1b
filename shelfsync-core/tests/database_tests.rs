// Tests for the catalog store

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use shelfsync_core::data::Database;
use shelfsync_scanner::result::{
    CategoryNode, CrawlOutcome, Currency, NavigationHeading, PageOutcome, Price, ProductRecord,
    Record, RecordKind,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use tempfile::TempDir;

const ROOT: &str = "https://shop.example/";

fn create_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("catalog.db");
    let db = Database::new(&db_path).unwrap();
    (temp_dir, db)
}

fn product(source: &str, title: &str, amount: &str) -> Record {
    let mut specs = BTreeMap::new();
    specs.insert("Format".to_string(), "Paperback".to_string());
    Record::Product(ProductRecord {
        id: format!("id-{}", title.to_lowercase()),
        title: title.to_string(),
        author: Some("Frank Herbert".to_string()),
        price: Some(Price {
            amount: Decimal::from_str(amount).unwrap(),
            currency: Currency::Gbp,
        }),
        image_url: Some(format!("{}cover.jpg", source)),
        proxied_image_url: None,
        source_url: Some(source.to_string()),
        available: true,
        acquired_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        specs,
    })
}

fn category(slug: &str, parent: Option<&str>) -> Record {
    Record::Category(CategoryNode {
        title: slug.to_string(),
        slug: slug.to_string(),
        parent_slug: parent.map(str::to_string),
        source_url: format!("{}{}", ROOT, slug),
        item_count: Some(12),
        acquired_at: Utc::now(),
    })
}

// ============================================================================
// Database Creation Tests
// ============================================================================

#[test]
fn test_database_creation() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("catalog.db");

    assert!(!Database::exists(&db_path));
    let db = Database::new(&db_path);
    assert!(db.is_ok());
    assert!(Database::exists(&db_path));
}

#[test]
fn test_database_drop() {
    let (temp_dir, db) = create_test_db();
    let db_path = temp_dir.path().join("catalog.db");
    drop(db);

    Database::drop(&db_path).unwrap();
    assert!(!Database::exists(&db_path));
}

// ============================================================================
// Record Tests
// ============================================================================

#[test]
fn test_product_round_trip_preserves_fields() {
    let (_temp_dir, db) = create_test_db();
    let original = product("https://shop.example/p/dune", "Dune", "12.99");

    assert_eq!(db.upsert_records(ROOT, &[original.clone()]).unwrap(), 1);
    let loaded = db.load_records(RecordKind::Product, ROOT).unwrap();
    assert_eq!(loaded, vec![original]);
}

#[test]
fn test_upsert_updates_in_place() {
    let (_temp_dir, db) = create_test_db();
    db.upsert_records(ROOT, &[product("https://shop.example/p/dune", "Dune", "12.99")])
        .unwrap();
    db.upsert_records(ROOT, &[product("https://shop.example/p/dune", "Dune", "9.99")])
        .unwrap();

    let loaded = db.load_records(RecordKind::Product, ROOT).unwrap();
    assert_eq!(loaded.len(), 1);
    let price = loaded[0].as_product().unwrap().price.clone().unwrap();
    assert_eq!(price.amount, Decimal::from_str("9.99").unwrap());
}

#[test]
fn test_product_shared_between_roots_stays_in_both() {
    let (_temp_dir, db) = create_test_db();
    let fiction = "https://shop.example/c/fiction";
    let bestsellers = "https://shop.example/c/bestsellers";

    db.upsert_records(fiction, &[product("https://shop.example/p/dune", "Dune", "12.99")])
        .unwrap();
    db.upsert_records(
        bestsellers,
        &[product("https://shop.example/p/dune", "Dune", "9.99")],
    )
    .unwrap();

    let in_fiction = db.load_records(RecordKind::Product, fiction).unwrap();
    let in_bestsellers = db.load_records(RecordKind::Product, bestsellers).unwrap();
    assert_eq!(in_fiction.len(), 1);
    assert_eq!(in_bestsellers.len(), 1);

    // One row, updated in place: both sets see the latest price.
    let price = in_fiction[0].as_product().unwrap().price.clone().unwrap();
    assert_eq!(price.amount, Decimal::from_str("9.99").unwrap());
    assert!(db.newest_acquired(RecordKind::Product, fiction).unwrap().is_some());
}

#[test]
fn test_categories_keyed_by_parent() {
    let (_temp_dir, db) = create_test_db();
    db.upsert_records(
        ROOT,
        &[
            category("classics", Some("fiction")),
            category("classics", Some("poetry")),
            category("fiction", None),
        ],
    )
    .unwrap();

    let loaded = db.load_records(RecordKind::Category, ROOT).unwrap();
    assert_eq!(loaded.len(), 3);
    let top_level: Vec<_> = loaded
        .iter()
        .filter_map(|r| match r {
            Record::Category(c) if c.parent_slug.is_none() => Some(c.slug.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(top_level, vec!["fiction"]);
}

#[test]
fn test_sets_are_isolated_by_root_and_kind() {
    let (_temp_dir, db) = create_test_db();
    db.upsert_records(
        ROOT,
        &[Record::Navigation(NavigationHeading {
            title: "Fiction".to_string(),
            slug: "fiction".to_string(),
            source_url: format!("{}fiction", ROOT),
            acquired_at: Utc::now(),
        })],
    )
    .unwrap();

    assert_eq!(db.load_records(RecordKind::Navigation, ROOT).unwrap().len(), 1);
    assert!(db.load_records(RecordKind::Product, ROOT).unwrap().is_empty());
    assert!(db
        .load_records(RecordKind::Navigation, "https://other.example/")
        .unwrap()
        .is_empty());
}

#[test]
fn test_newest_acquired() {
    let (_temp_dir, db) = create_test_db();
    assert!(db.newest_acquired(RecordKind::Navigation, ROOT).unwrap().is_none());

    let older = Utc::now() - Duration::hours(30);
    let newer = Utc::now() - Duration::hours(2);
    let records: Vec<Record> = [("a", older), ("b", newer)]
        .into_iter()
        .map(|(slug, at)| {
            Record::Navigation(NavigationHeading {
                title: slug.to_string(),
                slug: slug.to_string(),
                source_url: format!("{}{}", ROOT, slug),
                acquired_at: at,
            })
        })
        .collect();
    db.upsert_records(ROOT, &records).unwrap();

    let newest = db.newest_acquired(RecordKind::Navigation, ROOT).unwrap().unwrap();
    assert_eq!(newest.timestamp_millis(), newer.timestamp_millis());
}

// ============================================================================
// Session Tests
// ============================================================================

#[test]
fn test_record_and_list_sessions() {
    let (_temp_dir, db) = create_test_db();
    let outcome = CrawlOutcome {
        session_id: "session-1".to_string(),
        records: vec![product("https://shop.example/p/dune", "Dune", "12.99")],
        pages: vec![
            PageOutcome::new(ROOT.to_string()),
            PageOutcome::with_error(format!("{}page/2", ROOT), "HTTP status 503".to_string(), 3),
        ],
        budget_exhausted: false,
    };

    db.record_session(ROOT, RecordKind::Product, &outcome).unwrap();
    let sessions = db.recent_sessions(10).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0],
        (
            "session-1".to_string(),
            ROOT.to_string(),
            "product".to_string(),
            1
        )
    );
}
