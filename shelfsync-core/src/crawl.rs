use colored::Colorize;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use shelfsync_scanner::crawler::{CrawlConfig, CrawlEvent, Crawler, ProgressCallback};
use shelfsync_scanner::extract::Extractor;
use shelfsync_scanner::fetch::{Transport, UserAgentPool};
use shelfsync_scanner::result::{CrawlOutcome, PageOutcome, RecordKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

/// Options for configuring a crawl operation
pub struct CrawlOptions {
    pub urls: Vec<String>,
    pub kind: RecordKind,
    pub config: CrawlConfig,
    pub user_agents: Vec<String>,
    pub show_progress: bool,
}

/// Callback for reporting crawl progress
pub type CrawlProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Extract the path component from a URL
pub fn extract_url_path(url: &str) -> String {
    Url::parse(url)
        .ok()
        .map(|u| {
            let path = u.path().to_string();
            if path.is_empty() || path == "/" {
                "/".to_string()
            } else {
                path
            }
        })
        .unwrap_or_else(|| url.to_string())
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Starting crawl...");
    pb
}

/// Run one crawl session over all `urls` and return what it gathered.
pub async fn execute_crawl(
    options: CrawlOptions,
    transport: Arc<dyn Transport>,
    extractor: Arc<Extractor>,
    progress_callback: Option<CrawlProgressCallback>,
) -> CrawlOutcome {
    let CrawlOptions {
        urls,
        kind,
        config,
        user_agents,
        show_progress,
    } = options;

    let progress_bar = show_progress.then(|| Arc::new(spinner()));
    let processed = Arc::new(AtomicUsize::new(0));

    let pb = progress_bar.clone();
    let count = processed.clone();
    let user_callback = progress_callback.clone();
    let on_event: ProgressCallback = Arc::new(move |event: CrawlEvent| {
        let message = match &event {
            CrawlEvent::PageStarted { .. } => return,
            CrawlEvent::PageCompleted { records, .. } => {
                let done = count.fetch_add(1, Ordering::Relaxed) + 1;
                format!("Crawling... {} page(s), {} record(s) on the last", done, records)
            }
            CrawlEvent::PageFailed { url, attempts, .. } => {
                count.fetch_add(1, Ordering::Relaxed);
                format!("[!] {} failed after {} attempt(s)", url, attempts)
            }
            CrawlEvent::BudgetExhausted { budget } => {
                format!("[!] Page budget of {} reached", budget)
            }
        };
        if let Some(ref pb) = pb {
            pb.set_message(message.clone());
        }
        if let Some(ref callback) = user_callback {
            callback(message);
        }
    });

    if let Some(ref callback) = progress_callback
        && urls.len() > 1
    {
        callback(format!("Crawling {} seed URL(s) as one session", urls.len()));
    }

    let crawler = Crawler::new(transport, extractor, config)
        .with_user_agents(UserAgentPool::new(user_agents))
        .with_progress_callback(on_event);
    let outcome = crawler.run(&urls, kind).await;

    if let Some(ref pb) = progress_bar {
        pb.finish_with_message(format!(
            "Crawl complete! {} page(s) processed, {} record(s)",
            processed.load(Ordering::Relaxed),
            outcome.records.len()
        ));
    }

    outcome
}

fn status_label(page: &PageOutcome) -> String {
    if page.is_failure() {
        return "ERR".red().to_string();
    }
    let code = page.status_code.to_string();
    match page.status_code {
        200..=299 => code.green().to_string(),
        300..=399 => code.cyan().to_string(),
        400..=499 => code.yellow().to_string(),
        500..=599 => code.red().to_string(),
        _ => code,
    }
}

/// Human-readable summary of a crawl session, pages grouped by host.
pub fn generate_crawl_report(outcome: &CrawlOutcome) -> String {
    let mut report = String::new();
    report.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Session: {}\n", outcome.session_id));
    report.push_str(&format!("  Pages crawled: {}\n", outcome.pages_succeeded()));
    report.push_str(&format!("  Pages failed: {}\n", outcome.pages_failed()));
    report.push_str(&format!("  Records: {}\n", outcome.records.len()));
    if outcome.budget_exhausted {
        report.push_str(&format!("  {}\n", "Page budget exhausted".yellow()));
    }
    report.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");

    let mut by_host: IndexMap<String, Vec<&PageOutcome>> = IndexMap::new();
    for page in &outcome.pages {
        let host = Url::parse(&page.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        by_host.entry(host).or_default().push(page);
    }

    for (host, pages) in &by_host {
        report.push_str(&format!("## {}\n", host));
        report.push_str(&format!("  {} page(s)\n\n", pages.len()));
        for page in pages {
            let mut line = format!(
                "  {} {} ({} record(s))",
                status_label(page),
                extract_url_path(&page.url),
                page.records_found
            );
            if let Some(ref error) = page.error {
                line.push_str(&format!(" {}", error.bright_black()));
            }
            report.push_str(&line);
            report.push('\n');
        }
        report.push('\n');
    }

    report
}
