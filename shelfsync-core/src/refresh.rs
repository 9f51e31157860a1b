//! Stale-while-revalidate reads over the catalog.
//!
//! Readers always get cached data when any exists. Data older than the TTL
//! triggers one detached background re-acquisition per entity set; an empty
//! set is acquired synchronously.

use crate::data::CatalogError;
use crate::image::ImageProxy;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use shelfsync_scanner::crawler::Crawler;
use shelfsync_scanner::result::{Record, RecordKind};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The unit the controller caches and refreshes: one record kind under one
/// root URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntitySetKey {
    pub kind: RecordKind,
    pub root: String,
}

impl EntitySetKey {
    pub fn new(kind: RecordKind, root: impl Into<String>) -> Self {
        Self {
            kind,
            root: root.into(),
        }
    }
}

impl fmt::Display for EntitySetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.kind, self.root)
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load(&self, key: &EntitySetKey) -> Result<Vec<Record>, CatalogError>;
    async fn upsert(&self, key: &EntitySetKey, records: &[Record]) -> Result<usize, CatalogError>;

    /// Most recent acquisition in the set.
    async fn newest(&self, key: &EntitySetKey) -> Result<Option<DateTime<Utc>>, CatalogError> {
        Ok(self.load(key).await?.iter().map(Record::acquired_at).max())
    }
}

/// Produces fresh records for an entity set. Partial results are fine;
/// acquisition itself never fails.
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, key: &EntitySetKey) -> Vec<Record>;
}

/// Crawls the set's root and routes product images through the proxy.
pub struct CrawlAcquirer {
    crawler: Crawler,
    images: Option<Arc<ImageProxy>>,
}

impl CrawlAcquirer {
    pub fn new(crawler: Crawler) -> Self {
        Self {
            crawler,
            images: None,
        }
    }

    pub fn with_image_proxy(mut self, images: Arc<ImageProxy>) -> Self {
        self.images = Some(images);
        self
    }
}

#[async_trait]
impl Acquirer for CrawlAcquirer {
    async fn acquire(&self, key: &EntitySetKey) -> Vec<Record> {
        let outcome = self.crawler.run(&[key.root.clone()], key.kind).await;
        if outcome.pages_failed() > 0 {
            warn!(
                "{}: {} of {} page(s) failed",
                key,
                outcome.pages_failed(),
                outcome.pages.len()
            );
        }
        let mut records = outcome.records;
        if let Some(images) = &self.images {
            images.rewrite_product_images(&mut records);
        }
        records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// Cached data within the TTL.
    Fresh,
    /// Cached data past the TTL; `scheduled` is false when a refresh for
    /// this set was already running.
    Stale { scheduled: bool },
    /// Nothing was cached, records were acquired before returning.
    Acquired,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Vec<Record>,
    pub newest: Option<DateTime<Utc>>,
    pub state: RefreshState,
}

type InFlight = Arc<Mutex<HashSet<EntitySetKey>>>;

/// Holds a key in the in-flight set and releases it on drop, including when
/// the refresh task unwinds.
struct InFlightGuard {
    in_flight: InFlight,
    key: EntitySetKey,
}

impl InFlightGuard {
    fn claim(in_flight: &InFlight, key: &EntitySetKey) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.key);
    }
}

pub struct StalenessController {
    store: Arc<dyn CatalogStore>,
    acquirer: Arc<dyn Acquirer>,
    ttl: TimeDelta,
    in_flight: InFlight,
}

impl StalenessController {
    pub fn new(store: Arc<dyn CatalogStore>, acquirer: Arc<dyn Acquirer>, ttl: Duration) -> Self {
        Self {
            store,
            acquirer,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_stale(&self, newest: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(newest) > self.ttl
    }

    pub async fn get_or_refresh(&self, key: &EntitySetKey) -> Result<Snapshot, CatalogError> {
        let cached = self.store.load(key).await?;

        if cached.is_empty() {
            info!("No cached data for {}, acquiring now", key);
            let records = self.acquirer.acquire(key).await;
            self.store.upsert(key, &records).await?;
            return Ok(Snapshot {
                newest: records.iter().map(Record::acquired_at).max(),
                records,
                state: RefreshState::Acquired,
            });
        }

        let newest = self.store.newest(key).await?;
        let state = match newest {
            Some(at) if !self.is_stale(at) => RefreshState::Fresh,
            _ => RefreshState::Stale {
                scheduled: self.schedule_refresh(key),
            },
        };
        debug!("{}: serving {} cached record(s), {:?}", key, cached.len(), state);

        Ok(Snapshot {
            records: cached,
            newest,
            state,
        })
    }

    /// Start a detached re-acquisition unless one is already running for
    /// this key. Returns whether a new task was spawned.
    pub fn schedule_refresh(&self, key: &EntitySetKey) -> bool {
        let Some(guard) = InFlightGuard::claim(&self.in_flight, key) else {
            debug!("Refresh for {} already in flight", key);
            return false;
        };

        let store = self.store.clone();
        let acquirer = self.acquirer.clone();
        let key = key.clone();
        info!("Scheduling background refresh for {}", key);

        tokio::spawn(async move {
            let _guard = guard;
            let records = acquirer.acquire(&key).await;
            match store.upsert(&key, &records).await {
                Ok(count) => info!("Background refresh of {} stored {} record(s)", key, count),
                Err(e) => warn!("Background refresh of {} failed: {}", key, e),
            }
        });
        true
    }

    pub fn is_refreshing(&self, key: &EntitySetKey) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Poll until no refresh for `key` is running.
    pub async fn wait_for_refresh(&self, key: &EntitySetKey) {
        while self.is_refreshing(key) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
