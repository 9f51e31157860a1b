use anyhow::{Context, Result, anyhow, bail};
use clap::ArgMatches;
use colored::Colorize;
use shelfsync_core::config::{
    CONFIG_FILE_NAME, DATABASE_FILE_NAME, DEFAULT_CONFIG_DIR, Settings, expand_path,
};
use shelfsync_core::data::Database;
use shelfsync_core::image::ImageProxy;
use shelfsync_core::refresh::{CrawlAcquirer, EntitySetKey, RefreshState, StalenessController};
use shelfsync_core::report::{ReportFormat, generate_report, save_report};
use shelfsync_scanner::crawler::Crawler;
use shelfsync_scanner::extract::Extractor;
use shelfsync_scanner::fetch::{ReqwestTransport, Transport, UserAgentPool};
use shelfsync_scanner::result::{Record, RecordKind};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

// Helper functions for crawl handler

/// Load URLs from either a file or a single URL argument
pub fn load_urls_from_source(url: Option<&Url>, hosts_file: Option<&PathBuf>) -> Result<Vec<String>> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if let Some(url) = url {
        Ok(vec![url.as_str().to_string()])
    } else {
        bail!("Either --url or --hosts-file must be provided")
    }
}

/// Load and parse URLs from a file, skipping blanks and `#` comments
pub fn load_urls_from_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hosts file {}", path.display()))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        bail!("No valid URLs found in {}", path.display());
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add https:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if let Ok(url) = Url::parse(line)
        && url.has_host()
    {
        return Some(line.to_string());
    }

    let with_scheme = format!("https://{}", line);
    if let Ok(url) = Url::parse(&with_scheme)
        && url.host_str().is_some_and(|h| h.contains('.') || h == "localhost")
    {
        return Some(with_scheme);
    }

    eprintln!("{} Skipping invalid URL '{}'", "⚠".yellow(), line);
    None
}

pub fn parse_kind(args: &ArgMatches) -> Result<RecordKind> {
    let raw = args
        .get_one::<String>("kind")
        .map(String::as_str)
        .unwrap_or("product");
    RecordKind::from_str(raw).map_err(|e| anyhow!("{}", e))
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> Result<String> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().to_lowercase())
}

fn transport(settings: &Settings) -> Result<Arc<dyn Transport>> {
    ReqwestTransport::shared(settings.fetch.timeout(), settings.fetch.max_page_bytes)
        .context("Failed to build HTTP client")
}

fn image_proxy(settings: &Settings) -> Result<ImageProxy> {
    let transport =
        ReqwestTransport::shared_without_redirects(settings.image.timeout(), settings.image.max_bytes)
            .context("Failed to build HTTP client")?;
    Ok(ImageProxy::new(transport, settings.image.clone())
        .with_user_agents(UserAgentPool::new(settings.fetch.user_agents.clone())))
}

fn crawler(settings: &Settings) -> Result<Crawler> {
    let extractor = Extractor::new(&settings.strategies).context("Invalid selector strategies")?;
    Ok(Crawler::new(transport(settings)?, Arc::new(extractor), settings.crawl)
        .with_user_agents(UserAgentPool::new(settings.fetch.user_agents.clone())))
}

fn open_catalog(settings: &Settings) -> Result<Database> {
    let path = settings.catalog.database_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Database::new(&path).with_context(|| format!("Failed to open catalog at {}", path.display()))
}

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    print_divider();
    println!("{}", "  SHELFSYNC INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let raw_dir = args
        .get_one::<String>("PATH")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_DIR);
    let force = args.get_flag("force");
    let config_dir = expand_path(raw_dir);
    let config_path = config_dir.join(CONFIG_FILE_NAME);
    let db_path = config_dir.join(DATABASE_FILE_NAME);

    println!(
        "{} Target: {}",
        "→".blue(),
        config_dir.display().to_string().bright_white()
    );
    println!();

    if (config_path.exists() || Database::exists(&db_path)) && !force {
        println!("{}", "⚠ WARNING".yellow().bold());
        println!("An existing installation was found:");
        for existing in [&config_path, &db_path].into_iter().filter(|p| p.exists()) {
            println!("  {} {}", "•".yellow(), existing.display().to_string().bright_white());
        }
        println!();

        let response = print_prompt("Overwrite it? [y/N]:")?;
        println!();
        if response != "y" && response != "yes" {
            println!("{} Initialization cancelled.", "✗".red().bold());
            return Ok(());
        }
    }

    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let mut settings = Settings::default();
    settings.catalog.database = db_path.display().to_string();
    settings.save(&config_path)?;
    println!(
        "{} Settings written: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );

    if Database::exists(&db_path) {
        Database::drop(&db_path)?;
        println!("{} Existing catalog removed", "✓".green().bold());
    }
    Database::new(&db_path)?;
    println!(
        "{} Catalog initialized: {}",
        "✓".green().bold(),
        db_path.display().to_string().bright_white()
    );

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    Ok(())
}

pub async fn handle_crawl(sub_matches: &ArgMatches, mut settings: Settings, quiet: bool) -> Result<()> {
    let url = sub_matches.get_one::<Url>("url");
    let hosts_file = sub_matches.get_one::<PathBuf>("hosts-file");
    let urls = load_urls_from_source(url, hosts_file)?;
    let kind = parse_kind(sub_matches)?;

    if let Some(budget) = sub_matches.get_one::<usize>("budget") {
        settings.crawl.page_budget = *budget;
    }
    if let Some(concurrency) = sub_matches.get_one::<usize>("concurrency") {
        settings.crawl.max_concurrency = *concurrency;
    }
    let format = sub_matches
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::from_str(f))
        .unwrap_or(ReportFormat::Text);

    if !quiet {
        println!("Crawling {} seed(s) for {} records", urls.len(), kind);
        println!(
            "Concurrency: {}  Page budget: {}\n",
            settings.crawl.max_concurrency, settings.crawl.page_budget
        );
    }

    let extractor = Extractor::new(&settings.strategies).context("Invalid selector strategies")?;
    let options = shelfsync_core::crawl::CrawlOptions {
        urls: urls.clone(),
        kind,
        config: settings.crawl,
        user_agents: settings.fetch.user_agents.clone(),
        show_progress: !quiet,
    };
    let mut outcome = shelfsync_core::crawl::execute_crawl(
        options,
        transport(&settings)?,
        Arc::new(extractor),
        None,
    )
    .await;

    if sub_matches.get_flag("save") {
        image_proxy(&settings)?.rewrite_product_images(&mut outcome.records);
        let catalog = open_catalog(&settings)?;
        let root = &urls[0];
        let stored = catalog.upsert_records(root, &outcome.records)?;
        catalog.record_session(root, kind, &outcome)?;
        println!("{} Saved {} record(s) to the catalog", "✓".green().bold(), stored);
    }

    let report = match format {
        ReportFormat::Text if sub_matches.get_one::<PathBuf>("output").is_none() => {
            shelfsync_core::crawl::generate_crawl_report(&outcome)
                + &shelfsync_core::report::generate_text_report(&outcome)
        }
        other => generate_report(&outcome, other)?,
    };

    match sub_matches.get_one::<PathBuf>("output") {
        Some(path) => {
            save_report(&report, path)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!(
                "{} Report saved: {}",
                "✓".green().bold(),
                path.display().to_string().bright_white()
            );
        }
        None => print!("{}", report),
    }
    Ok(())
}

fn print_record(record: &Record) {
    match record {
        Record::Navigation(heading) => {
            println!("  {} {}", heading.title.bright_white(), heading.slug.bright_black())
        }
        Record::Category(category) => {
            let count = category
                .item_count
                .map(|n| format!(" ({})", n))
                .unwrap_or_default();
            println!("  {}{}", category.title.bright_white(), count.cyan());
        }
        Record::Product(product) => {
            let price = product
                .price
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let stock = if product.available {
                String::new()
            } else {
                format!(" {}", "sold out".red())
            };
            println!("  {} {}{}", product.title.bright_white(), price.green(), stock);
        }
    }
}

pub async fn handle_catalog(sub_matches: &ArgMatches, settings: Settings) -> Result<()> {
    let url = sub_matches
        .get_one::<Url>("url")
        .ok_or_else(|| anyhow!("--url is required"))?;
    let kind = parse_kind(sub_matches)?;
    let wait = sub_matches.get_flag("wait");
    let history = sub_matches.get_flag("history");

    let images = Arc::new(image_proxy(&settings)?);
    let acquirer = CrawlAcquirer::new(crawler(&settings)?).with_image_proxy(images);
    let store = Arc::new(open_catalog(&settings)?);
    let controller =
        StalenessController::new(store.clone(), Arc::new(acquirer), settings.catalog.ttl());

    let key = EntitySetKey::new(kind, url.as_str());
    let snapshot = controller.get_or_refresh(&key).await?;

    let state = match snapshot.state {
        RefreshState::Fresh => "fresh".green(),
        RefreshState::Acquired => "acquired now".cyan(),
        RefreshState::Stale { scheduled: true } => "stale, refresh scheduled".yellow(),
        RefreshState::Stale { scheduled: false } => "stale, refresh in flight".yellow(),
    };
    println!("{} ({} record(s), {})", key.to_string().bright_white().bold(), snapshot.records.len(), state);
    if let Some(newest) = snapshot.newest {
        println!("Newest acquisition: {}", newest.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    for record in &snapshot.records {
        print_record(record);
    }

    if history {
        print_session_history(&store, url.as_str())?;
    }

    if matches!(snapshot.state, RefreshState::Stale { .. }) {
        if wait {
            println!("\n{} Waiting for background refresh...", "→".blue());
            controller.wait_for_refresh(&key).await;
            println!("{} Catalog refreshed", "✓".green().bold());
        } else {
            println!(
                "\n{} Background refresh is abandoned on exit; pass --wait to let it finish",
                "ℹ".blue()
            );
        }
    }
    Ok(())
}

const HISTORY_LIMIT: usize = 50;

fn print_session_history(store: &Database, root: &str) -> Result<()> {
    let sessions: Vec<_> = store
        .recent_sessions(HISTORY_LIMIT)?
        .into_iter()
        .filter(|(_, set_root, _, _)| set_root == root)
        .collect();
    print_divider();
    println!("{}", "Recent crawl sessions".bright_white().bold());
    if sessions.is_empty() {
        println!("  (none recorded)");
    }
    for (id, _, kind, records) in sessions {
        println!("  {} {} {} record(s)", id.dimmed(), kind.cyan(), records);
    }
    Ok(())
}

pub async fn handle_image_fetch(sub_matches: &ArgMatches, settings: Settings) -> Result<()> {
    let url = sub_matches
        .get_one::<String>("URL")
        .ok_or_else(|| anyhow!("an image URL is required"))?;
    let proxy = image_proxy(&settings)?;

    let response = proxy.fetch_image(url).await?;
    println!(
        "{} {} ({} bytes)",
        "✓".green().bold(),
        response.mime_type.bright_white(),
        response.size
    );
    println!("Cache-Control: {}", proxy.cache_control());

    if let Some(path) = sub_matches.get_one::<PathBuf>("output") {
        fs::write(path, &response.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!(
            "{} Saved: {}",
            "✓".green().bold(),
            path.display().to_string().bright_white()
        );
    }
    Ok(())
}

pub async fn handle_image_warm(sub_matches: &ArgMatches, settings: Settings) -> Result<()> {
    let hosts_file = sub_matches
        .get_one::<PathBuf>("hosts-file")
        .ok_or_else(|| anyhow!("--hosts-file is required"))?;
    let urls = load_urls_from_file(hosts_file)?;
    let proxy = image_proxy(&settings)?;

    println!("Warming image cache with {} URL(s)\n", urls.len());
    let report = proxy.warm(&urls).await;
    println!("  {} downloaded", report.downloaded.to_string().green());
    println!("  {} already cached", report.already_cached.to_string().cyan());
    println!("  {} failed", report.failed.to_string().red());
    println!("  {} expired entries purged", report.expired);
    println!();
    println!("{}", serde_json::to_string_pretty(&proxy.stats().await)?);
    Ok(())
}
