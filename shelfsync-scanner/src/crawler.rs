use crate::backoff::RetryPolicy;
use crate::error::FetchError;
use crate::extract::{Extractor, Page, PageExtraction};
use crate::fetch::{ACCEPT_HTML, Transport, TransportRequest, UserAgentPool};
use crate::result::{CrawlOutcome, PageOutcome, Record, RecordKind};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Session limits for one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_concurrency: usize,
    pub page_budget: usize,
    pub retry: RetryPolicy,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            page_budget: 50,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrawlEvent {
    PageStarted {
        url: String,
    },
    PageCompleted {
        url: String,
        records: usize,
        next_links: usize,
    },
    PageFailed {
        url: String,
        error: String,
        attempts: u32,
    },
    BudgetExhausted {
        budget: usize,
    },
}

pub type ProgressCallback = Arc<dyn Fn(CrawlEvent) + Send + Sync>;

/// Canonical form used for the seen-set: no fragment, and no trailing slash
/// except on the root path.
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}

struct PageVisit {
    url: String,
    attempts: u32,
    result: Result<(u16, PageExtraction), FetchError>,
}

pub struct Crawler {
    transport: Arc<dyn Transport>,
    extractor: Arc<Extractor>,
    agents: Arc<UserAgentPool>,
    config: CrawlConfig,
    progress_callback: Option<ProgressCallback>,
}

impl Crawler {
    pub fn new(transport: Arc<dyn Transport>, extractor: Arc<Extractor>, config: CrawlConfig) -> Self {
        Self {
            transport,
            extractor,
            agents: Arc::new(UserAgentPool::default()),
            config,
            progress_callback: None,
        }
    }

    pub fn with_user_agents(mut self, agents: UserAgentPool) -> Self {
        self.agents = Arc::new(agents);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    fn emit(&self, event: CrawlEvent) {
        if let Some(ref callback) = self.progress_callback {
            callback(event);
        }
    }

    /// Crawl from `seeds`, following pagination, and collect records of
    /// `kind`. Always returns whatever was gathered, even if every page failed.
    pub async fn run(&self, seeds: &[String], kind: RecordKind) -> CrawlOutcome {
        let session_id = Uuid::new_v4().to_string();
        let ceiling = self.config.max_concurrency.max(1);
        let budget = self.config.page_budget;
        info!(
            "Session {} starting: {} seed(s), kind {}, concurrency {}, budget {}",
            session_id,
            seeds.len(),
            kind,
            ceiling,
            budget
        );

        let mut session = Session::new(budget);
        for seed in seeds {
            match Url::parse(seed.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {
                    if session.offer(url) == Offer::OverBudget {
                        self.budget_reached(&mut session);
                    }
                }
                Ok(url) => warn!("Skipping seed with unsupported scheme: {}", url),
                Err(e) => warn!("Skipping invalid seed '{}': {}", seed, e),
            }
        }

        let mut tasks: JoinSet<PageVisit> = JoinSet::new();
        let mut in_flight: HashMap<Id, String> = HashMap::new();
        let mut records: IndexMap<String, Record> = IndexMap::new();
        let mut pages = Vec::new();

        loop {
            while tasks.len() < ceiling {
                let Some(url) = session.frontier.pop_front() else {
                    break;
                };
                session.dispatched += 1;
                self.emit(CrawlEvent::PageStarted {
                    url: url.to_string(),
                });
                let label = url.to_string();
                let handle = tasks.spawn(visit_page(
                    self.transport.clone(),
                    self.extractor.clone(),
                    self.agents.clone(),
                    self.config.retry,
                    url,
                    kind,
                ));
                in_flight.insert(handle.id(), label);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let visit = match joined {
                Ok((id, visit)) => {
                    in_flight.remove(&id);
                    visit
                }
                // A panicking page still gets an outcome so it is never silently dropped.
                Err(e) => PageVisit {
                    url: in_flight.remove(&e.id()).unwrap_or_default(),
                    attempts: 1,
                    result: Err(FetchError::TaskFailed(e.to_string())),
                },
            };

            match visit.result {
                Ok((status_code, extraction)) => {
                    let found = extraction.records.len();
                    for record in extraction.records {
                        records.insert(record.identity(), record);
                    }

                    let mut queued = 0;
                    for link in &extraction.next_links {
                        let Ok(next) = Url::parse(link) else {
                            continue;
                        };
                        match session.offer(next) {
                            Offer::Queued => queued += 1,
                            Offer::Seen => {}
                            Offer::OverBudget => self.budget_reached(&mut session),
                        }
                    }

                    debug!(
                        "{} -> {} record(s), {} new page(s) queued",
                        visit.url, found, queued
                    );
                    self.emit(CrawlEvent::PageCompleted {
                        url: visit.url.clone(),
                        records: found,
                        next_links: extraction.next_links.len(),
                    });

                    let mut page = PageOutcome::new(visit.url);
                    page.status_code = status_code;
                    page.records_found = found;
                    page.next_links = extraction.next_links;
                    page.attempts = visit.attempts;
                    pages.push(page);
                }
                Err(err) => {
                    warn!(
                        "Giving up on {} after {} attempt(s): {}",
                        visit.url, visit.attempts, err
                    );
                    self.emit(CrawlEvent::PageFailed {
                        url: visit.url.clone(),
                        error: err.to_string(),
                        attempts: visit.attempts,
                    });
                    pages.push(PageOutcome::with_error(
                        visit.url,
                        err.to_string(),
                        visit.attempts,
                    ));
                }
            }
        }

        let outcome = CrawlOutcome {
            session_id,
            records: records.into_values().collect(),
            pages,
            budget_exhausted: session.budget_exhausted,
        };
        info!(
            "Session {} complete: {} page(s) ok, {} failed, {} record(s)",
            outcome.session_id,
            outcome.pages_succeeded(),
            outcome.pages_failed(),
            outcome.records.len()
        );
        outcome
    }

    fn budget_reached(&self, session: &mut Session) {
        if !session.budget_exhausted {
            session.budget_exhausted = true;
            info!("Page budget of {} reached, no further pages will be queued", session.budget);
            self.emit(CrawlEvent::BudgetExhausted {
                budget: session.budget,
            });
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Offer {
    Queued,
    Seen,
    OverBudget,
}

/// Per-session crawl state, owned by the session loop.
struct Session {
    seen: HashSet<String>,
    frontier: VecDeque<Url>,
    dispatched: usize,
    budget: usize,
    budget_exhausted: bool,
}

impl Session {
    fn new(budget: usize) -> Self {
        Self {
            seen: HashSet::new(),
            frontier: VecDeque::new(),
            dispatched: 0,
            budget,
            budget_exhausted: false,
        }
    }

    /// Queue `url` unless it was already seen or the budget is spoken for.
    fn offer(&mut self, url: Url) -> Offer {
        let key = normalize_url(&url);
        if self.seen.contains(&key) {
            return Offer::Seen;
        }
        if self.dispatched + self.frontier.len() >= self.budget {
            return Offer::OverBudget;
        }
        self.seen.insert(key);
        self.frontier.push_back(url);
        Offer::Queued
    }
}

async fn visit_page(
    transport: Arc<dyn Transport>,
    extractor: Arc<Extractor>,
    agents: Arc<UserAgentPool>,
    retry: RetryPolicy,
    url: Url,
    kind: RecordKind,
) -> PageVisit {
    let label = url.to_string();
    let referer = format!("{}/", url.origin().ascii_serialization());

    let fetched = retry
        .run(&label, |attempt| {
            let request = TransportRequest {
                url: url.clone(),
                user_agent: agents.next_agent().to_string(),
                referer: Some(referer.clone()),
                accept: ACCEPT_HTML,
            };
            let transport = transport.clone();
            async move {
                debug!("Fetching {} (attempt {})", request.url, attempt);
                transport.get(&request).await
            }
        })
        .await;

    let result = fetched.result.map(|response| {
        let is_html = response
            .content_type
            .as_deref()
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        if !is_html {
            debug!("Not extracting non-HTML response from {}", label);
            return (response.status, PageExtraction::default());
        }
        let html = String::from_utf8_lossy(&response.body);
        let page = Page::new(url.clone(), html.as_ref());
        (response.status, extractor.scan(&page, kind))
    });

    PageVisit {
        url: label,
        attempts: fetched.attempts,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::StrategyBook;
    use crate::fetch::{ReqwestTransport, TransportResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    /// In-memory site with per-URL scripted failures and in-flight tracking.
    #[derive(Default)]
    struct FakeSite {
        pages: HashMap<String, String>,
        failures: StdMutex<HashMap<String, Vec<FetchError>>>,
        requests: StdMutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        panics_on: Option<String>,
    }

    impl FakeSite {
        fn page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }

        fn failing(self, url: &str, errors: Vec<FetchError>) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert(url.to_string(), errors);
            self
        }

        fn panicking(mut self, url: &str) -> Self {
            self.panics_on = Some(url.to_string());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn requests_for(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.as_str() == url)
                .count()
        }

        fn total_requests(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeSite {
        async fn get(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError> {
            let url = request.url.to_string();
            self.requests.lock().unwrap().push(url.clone());
            if self.panics_on.as_deref() == Some(url.as_str()) {
                panic!("transport blew up on {url}");
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(queue) = self.failures.lock().unwrap().get_mut(&url)
                && !queue.is_empty()
            {
                return Err(queue.remove(0));
            }

            match self.pages.get(&url) {
                Some(html) => Ok(TransportResponse {
                    final_url: request.url.clone(),
                    status: 200,
                    content_type: Some("text/html; charset=utf-8".to_string()),
                    body: html.as_bytes().to_vec(),
                }),
                None => Err(FetchError::Status(404)),
            }
        }
    }

    fn product_html(items: &[(&str, &str)], next: Option<&str>) -> String {
        let mut html = String::from("<html><body>");
        for (href, title) in items {
            html.push_str(&format!(
                r#"<div class="product-card"><a href="{href}"><h3>{title}</h3></a><span class="price">£5.00</span></div>"#
            ));
        }
        if let Some(next) = next {
            html.push_str(&format!(r#"<a rel="next" href="{next}">Next</a>"#));
        }
        html.push_str("</body></html>");
        html
    }

    fn crawler(site: Arc<FakeSite>, config: CrawlConfig) -> Crawler {
        let extractor = Arc::new(Extractor::new(&StrategyBook::default()).unwrap());
        Crawler::new(site, extractor, config)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 1, 5)
    }

    #[test]
    fn test_normalize_url() {
        let a = Url::parse("https://shop.example/books/#top").unwrap();
        let b = Url::parse("https://shop.example/books").unwrap();
        assert_eq!(normalize_url(&a), normalize_url(&b));
        let root = Url::parse("https://shop.example/").unwrap();
        assert_eq!(normalize_url(&root), "https://shop.example/");
    }

    #[tokio::test]
    async fn test_pagination_visited_once() {
        let site = Arc::new(
            FakeSite::default()
                .page(
                    "https://shop.example/books",
                    &product_html(&[("/p/one", "Book One")], Some("/books?page=2")),
                )
                .page(
                    "https://shop.example/books?page=2",
                    // points back at page one with a trailing slash and a fragment
                    &product_html(&[("/p/two", "Book Two")], Some("/books/#top")),
                ),
        );
        let crawler = crawler(site.clone(), CrawlConfig::default());

        let outcome = crawler
            .run(&["https://shop.example/books".to_string()], RecordKind::Product)
            .await;

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.pages.len(), 2);
        assert_eq!(site.requests_for("https://shop.example/books"), 1);
        assert_eq!(site.requests_for("https://shop.example/books?page=2"), 1);
        assert!(!outcome.budget_exhausted);
    }

    #[tokio::test]
    async fn test_budget_never_exceeded() {
        let mut site = FakeSite::default();
        for n in 1..=10 {
            site = site.page(
                &format!("https://shop.example/list?page={n}"),
                &product_html(
                    &[(&format!("/p/{n}"), &format!("Book {n}"))],
                    Some(&format!("/list?page={}", n + 1)),
                ),
            );
        }
        let site = Arc::new(site);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let config = CrawlConfig {
            page_budget: 3,
            ..CrawlConfig::default()
        };
        let crawler = crawler(site.clone(), config).with_progress_callback(Arc::new(move |event| {
            events_clone.lock().unwrap().push(event);
        }));

        let outcome = crawler
            .run(&["https://shop.example/list?page=1".to_string()], RecordKind::Product)
            .await;

        assert_eq!(site.total_requests(), 3);
        assert_eq!(outcome.pages.len(), 3);
        assert_eq!(outcome.records.len(), 3);
        assert!(outcome.budget_exhausted);

        let events = events.lock().unwrap();
        let exhausted = events
            .iter()
            .filter(|e| matches!(e, CrawlEvent::BudgetExhausted { budget: 3 }))
            .count();
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn test_panicking_page_is_reported_as_failed() {
        let site = Arc::new(
            FakeSite::default()
                .page(
                    "https://shop.example/a",
                    &product_html(&[("/p/one", "Book One")], None),
                )
                .panicking("https://shop.example/b"),
        );
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let crawler = crawler(site, CrawlConfig::default()).with_progress_callback(Arc::new(
            move |event| {
                events_clone.lock().unwrap().push(event);
            },
        ));

        let outcome = crawler
            .run(
                &[
                    "https://shop.example/a".to_string(),
                    "https://shop.example/b".to_string(),
                ],
                RecordKind::Product,
            )
            .await;

        assert_eq!(outcome.pages.len(), 2);
        assert_eq!(outcome.records.len(), 1);
        let failed: Vec<_> = outcome.pages.iter().filter(|p| p.is_failure()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].url, "https://shop.example/b");

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            CrawlEvent::PageFailed { url, .. } if url == "https://shop.example/b"
        )));
    }

    #[tokio::test]
    async fn test_huge_page_number_is_crawled() {
        let seed = "https://shop.example/list?page=4294967295";
        let site = Arc::new(FakeSite::default().page(
            seed,
            r#"<html><body>
                <div class="product-card"><a href="/p/last"><h3>Last Book</h3></a><span class="price">£5.00</span></div>
                <a href="/list?page=1">1</a>
                <a href="/list?page=0">0</a>
            </body></html>"#,
        ));
        let crawler = crawler(site.clone(), CrawlConfig::default());

        let outcome = crawler.run(&[seed.to_string()], RecordKind::Product).await;

        assert_eq!(outcome.pages.len(), 1);
        assert!(!outcome.pages[0].is_failure());
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(site.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let mut site = FakeSite::default().with_delay(Duration::from_millis(20));
        let mut seeds = Vec::new();
        for n in 0..6 {
            let url = format!("https://shop.example/shelf/{n}");
            site = site.page(&url, &product_html(&[(&format!("/p/{n}"), "Some Book")], None));
            seeds.push(url);
        }
        let site = Arc::new(site);
        let crawler = crawler(site.clone(), CrawlConfig::default());

        let outcome = crawler.run(&seeds, RecordKind::Product).await;

        assert_eq!(outcome.pages.len(), 6);
        let peak = site.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak in-flight was {}", peak);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let site = Arc::new(
            FakeSite::default()
                .page(
                    "https://shop.example/flaky",
                    &product_html(&[("/p/a", "Flaky Book")], None),
                )
                .failing(
                    "https://shop.example/flaky",
                    vec![FetchError::Status(503), FetchError::Timeout(Duration::from_secs(1))],
                ),
        );
        let config = CrawlConfig {
            retry: fast_retry(3),
            ..CrawlConfig::default()
        };
        let outcome = crawler(site.clone(), config)
            .run(&["https://shop.example/flaky".to_string()], RecordKind::Product)
            .await;

        assert_eq!(site.requests_for("https://shop.example/flaky"), 3);
        assert_eq!(outcome.pages[0].attempts, 3);
        assert!(!outcome.pages[0].is_failure());
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_results_when_pages_fail() {
        let site = Arc::new(
            FakeSite::default()
                .page(
                    "https://shop.example/good",
                    &product_html(&[("/p/good", "Good Book")], None),
                )
                .page("https://shop.example/down", "<html></html>")
                .failing(
                    "https://shop.example/down",
                    vec![
                        FetchError::Network("connection reset".to_string()),
                        FetchError::Network("connection reset".to_string()),
                        FetchError::Network("connection reset".to_string()),
                        FetchError::Network("connection reset".to_string()),
                    ],
                ),
        );
        let config = CrawlConfig {
            retry: fast_retry(4),
            ..CrawlConfig::default()
        };
        let outcome = crawler(site.clone(), config)
            .run(
                &[
                    "https://shop.example/good".to_string(),
                    "https://shop.example/down".to_string(),
                    "https://shop.example/missing".to_string(),
                ],
                RecordKind::Product,
            )
            .await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.pages_failed(), 2);
        assert_eq!(site.requests_for("https://shop.example/down"), 4);
        // 404 is permanent
        assert_eq!(site.requests_for("https://shop.example/missing"), 1);
    }

    #[tokio::test]
    async fn test_invalid_seeds_skipped() {
        let site = Arc::new(FakeSite::default().page(
            "https://shop.example/ok",
            &product_html(&[("/p/ok", "Fine Book")], None),
        ));
        let outcome = crawler(site.clone(), CrawlConfig::default())
            .run(
                &[
                    "not a url".to_string(),
                    "ftp://shop.example/file".to_string(),
                    "https://shop.example/ok".to_string(),
                ],
                RecordKind::Product,
            )
            .await;

        assert_eq!(site.total_requests(), 1);
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_returns_empty_outcome() {
        let site = Arc::new(FakeSite::default());
        let outcome = crawler(site, CrawlConfig::default())
            .run(&["https://gone.example/".to_string()], RecordKind::Product)
            .await;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.pages_failed(), 1);
    }

    #[tokio::test]
    async fn test_later_acquisition_updates_in_place() {
        let site = Arc::new(
            FakeSite::default()
                .page(
                    "https://shop.example/a",
                    &product_html(&[("/p/shared", "Old Title"), ("/p/only-a", "Only A")], None),
                )
                .page(
                    "https://shop.example/b",
                    &product_html(&[("/p/shared", "New Title")], None),
                ),
        );
        let config = CrawlConfig {
            max_concurrency: 1,
            ..CrawlConfig::default()
        };
        let outcome = crawler(site, config)
            .run(
                &["https://shop.example/a".to_string(), "https://shop.example/b".to_string()],
                RecordKind::Product,
            )
            .await;

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].title(), "New Title");
        assert_eq!(outcome.records[1].title(), "Only A");
    }

    #[tokio::test]
    async fn test_crawl_over_http() {
        let mock_server = MockServer::start().await;

        let listing = format!(
            r#"<html><body>
                <div class="product-card"><a href="{0}/p/dune"><h3>Dune</h3></a><span class="price">£9.99</span></div>
                <div class="product-card"><a href="/p/emma"><h3>Emma</h3></a><span class="price">£4.50</span></div>
            </body></html>"#,
            mock_server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/shop"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_bytes(listing.as_bytes()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::shared(Duration::from_secs(5), 1024 * 1024).unwrap();
        let extractor = Arc::new(Extractor::new(&StrategyBook::default()).unwrap());
        let crawler = Crawler::new(transport, extractor, CrawlConfig::default());

        let outcome = crawler
            .run(&[format!("{}/shop", mock_server.uri())], RecordKind::Product)
            .await;

        let products: Vec<_> = outcome.products().collect();
        assert_eq!(products.len(), 2);
        assert_eq!(
            products[1].source_url.as_deref(),
            Some(format!("{}/p/emma", mock_server.uri()).as_str())
        );
        assert_eq!(outcome.pages[0].status_code, 200);
    }
}
