// Report generation from crawl sessions

use serde::{Deserialize, Serialize};
use shelfsync_scanner::result::{CrawlOutcome, Record};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
    Csv,
    Markdown,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            "csv" => Some(ReportFormat::Csv),
            "markdown" | "md" => Some(ReportFormat::Markdown),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

pub fn generate_report(outcome: &CrawlOutcome, format: ReportFormat) -> Result<String, ReportError> {
    match format {
        ReportFormat::Text => Ok(generate_text_report(outcome)),
        ReportFormat::Json => Ok(generate_json_report(outcome)?),
        ReportFormat::Csv => generate_csv_report(outcome),
        ReportFormat::Markdown => Ok(generate_markdown_report(outcome)),
    }
}

fn record_detail(record: &Record) -> String {
    match record {
        Record::Navigation(heading) => heading.slug.clone(),
        Record::Category(category) => {
            let count = category
                .item_count
                .map(|n| format!(" ({} items)", n))
                .unwrap_or_default();
            match category.parent_slug {
                Some(ref parent) => format!("{}/{}{}", parent, category.slug, count),
                None => format!("{}{}", category.slug, count),
            }
        }
        Record::Product(product) => {
            let price = product
                .price
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "no price".to_string());
            let stock = if product.available { "" } else { ", sold out" };
            match product.author {
                Some(ref author) => format!("{} by {}{}", price, author, stock),
                None => format!("{}{}", price, stock),
            }
        }
    }
}

pub fn generate_text_report(outcome: &CrawlOutcome) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                          SHELFSYNC CRAWL REPORT\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Session ID:    {}\n", outcome.session_id));
    report.push_str(&format!("Pages OK:      {}\n", outcome.pages_succeeded()));
    report.push_str(&format!("Pages Failed:  {}\n", outcome.pages_failed()));
    report.push_str(&format!("Records:       {}\n", outcome.records.len()));
    if outcome.budget_exhausted {
        report.push_str("Budget:        exhausted\n");
    }
    report.push('\n');

    if !outcome.records.is_empty() {
        report.push_str(RULE);
        report.push_str("RECORDS\n");
        report.push_str(RULE);
        report.push('\n');
        for (idx, record) in outcome.records.iter().enumerate() {
            report.push_str(&format!("[{}] {} ({})\n", idx + 1, record.title(), record.kind()));
            report.push_str(&format!("    {}\n", record_detail(record)));
            if let Some(source) = record.source_url() {
                report.push_str(&format!("    {}\n", source));
            }
        }
        report.push('\n');
    }

    let failures: Vec<_> = outcome.pages.iter().filter(|p| p.is_failure()).collect();
    if !failures.is_empty() {
        report.push_str(RULE);
        report.push_str("FAILED PAGES\n");
        report.push_str(RULE);
        report.push('\n');
        for page in failures {
            report.push_str(&format!(
                "  {} ({} attempt(s)): {}\n",
                page.url,
                page.attempts,
                page.error.as_deref().unwrap_or("unknown error")
            ));
        }
        report.push('\n');
    }

    report.push_str(RULE);
    report.push_str("\nGenerated by shelfsync\n");
    report
}

pub fn generate_json_report(outcome: &CrawlOutcome) -> Result<String, serde_json::Error> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "shelfsync",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "format": "json"
            },
            "summary": {
                "session_id": outcome.session_id,
                "pages_succeeded": outcome.pages_succeeded(),
                "pages_failed": outcome.pages_failed(),
                "total_records": outcome.records.len(),
                "budget_exhausted": outcome.budget_exhausted
            },
            "records": outcome.records,
            "pages": outcome.pages
        }
    });

    serde_json::to_string_pretty(&json_report)
}

/// One row per record; columns that do not apply to a kind stay empty.
pub fn generate_csv_report(outcome: &CrawlOutcome) -> Result<String, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "kind",
        "title",
        "slug_or_id",
        "parent",
        "author",
        "price",
        "currency",
        "available",
        "image_url",
        "source_url",
        "acquired_at",
    ])?;

    for record in &outcome.records {
        let acquired = record.acquired_at().to_rfc3339();
        let row: [String; 11] = match record {
            Record::Navigation(h) => [
                "navigation".into(),
                h.title.clone(),
                h.slug.clone(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                h.source_url.clone(),
                acquired,
            ],
            Record::Category(c) => [
                "category".into(),
                c.title.clone(),
                c.slug.clone(),
                c.parent_slug.clone().unwrap_or_default(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                c.source_url.clone(),
                acquired,
            ],
            Record::Product(p) => [
                "product".into(),
                p.title.clone(),
                p.id.clone(),
                String::new(),
                p.author.clone().unwrap_or_default(),
                p.price.as_ref().map(|x| x.amount.to_string()).unwrap_or_default(),
                p.price
                    .as_ref()
                    .map(|x| x.currency.code().to_string())
                    .unwrap_or_default(),
                p.available.to_string(),
                p.image_url.clone().unwrap_or_default(),
                p.source_url.clone().unwrap_or_default(),
                acquired,
            ],
        };
        writer.write_record(&row)?;
    }

    let bytes = writer.into_inner().map_err(|e| ReportError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn md_escape(text: &str) -> String {
    text.replace('|', "\\|")
}

pub fn generate_markdown_report(outcome: &CrawlOutcome) -> String {
    let mut report = String::new();
    report.push_str("# shelfsync crawl report\n\n");
    report.push_str(&format!("- **Session:** `{}`\n", outcome.session_id));
    report.push_str(&format!("- **Pages OK:** {}\n", outcome.pages_succeeded()));
    report.push_str(&format!("- **Pages failed:** {}\n", outcome.pages_failed()));
    report.push_str(&format!("- **Records:** {}\n", outcome.records.len()));
    if outcome.budget_exhausted {
        report.push_str("- **Budget exhausted:** yes\n");
    }
    report.push('\n');

    if !outcome.records.is_empty() {
        report.push_str("## Records\n\n");
        report.push_str("| # | Kind | Title | Detail |\n");
        report.push_str("|---|------|-------|--------|\n");
        for (idx, record) in outcome.records.iter().enumerate() {
            report.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                idx + 1,
                record.kind(),
                md_escape(record.title()),
                md_escape(&record_detail(record))
            ));
        }
        report.push('\n');
    }

    if outcome.pages_failed() > 0 {
        report.push_str("## Failed pages\n\n");
        for page in outcome.pages.iter().filter(|p| p.is_failure()) {
            report.push_str(&format!(
                "- `{}` after {} attempt(s): {}\n",
                page.url,
                page.attempts,
                page.error.as_deref().unwrap_or("unknown error")
            ));
        }
        report.push('\n');
    }

    report
}

pub fn save_report(content: &str, path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
