use shelfsync::handlers::*;
use shelfsync::{extract_url_path, generate_crawl_report};
use shelfsync_scanner::result::{CrawlOutcome, PageOutcome};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use url::Url;

#[test]
fn test_parse_url_line_with_scheme() {
    let result = parse_url_line("https://example.com");
    assert_eq!(result, Some("https://example.com".to_string()));
}

#[test]
fn test_parse_url_line_without_scheme() {
    let result = parse_url_line("shop.example.com/books");
    assert_eq!(result, Some("https://shop.example.com/books".to_string()));
}

#[test]
fn test_parse_url_line_invalid() {
    assert_eq!(parse_url_line("not a valid url!!!"), None);
    assert_eq!(parse_url_line("nodots"), None);
}

#[test]
fn test_extract_url_path() {
    assert_eq!(extract_url_path("https://example.com/books/p2"), "/books/p2");
    assert_eq!(extract_url_path("https://example.com/"), "/");
    assert_eq!(extract_url_path("https://example.com"), "/");
}

#[test]
fn test_load_urls_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, "https://example.com")?;
    writeln!(temp_file, "# seeds for the spring sale")?;
    writeln!(temp_file, "books.example.org")?;
    writeln!(temp_file)?; // Empty line
    writeln!(temp_file, "https://cdn.example.com/a.jpg")?;

    let path = PathBuf::from(temp_file.path());
    let urls = load_urls_from_file(&path)?;

    assert_eq!(urls.len(), 3);
    assert_eq!(urls[0], "https://example.com");
    assert_eq!(urls[1], "https://books.example.org");
    assert_eq!(urls[2], "https://cdn.example.com/a.jpg");

    Ok(())
}

#[test]
fn test_load_urls_from_file_empty() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file).unwrap();
    writeln!(temp_file, "   ").unwrap();

    let path = PathBuf::from(temp_file.path());
    let result = load_urls_from_file(&path);

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("No valid URLs"));
}

#[test]
fn test_load_urls_from_missing_file() {
    let result = load_urls_from_file(&PathBuf::from("/nonexistent/seeds.txt"));
    assert!(result.unwrap_err().to_string().contains("Failed to read hosts file"));
}

#[test]
fn test_load_urls_from_source_single_url() {
    let url = Url::parse("https://example.com").unwrap();
    let result = load_urls_from_source(Some(&url), None).unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0], "https://example.com/");
}

#[test]
fn test_load_urls_from_source_no_input() {
    let result = load_urls_from_source(None, None);
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Either --url or --hosts-file must be provided")
    );
}

#[test]
fn test_generate_crawl_report() {
    colored::control::set_override(false);
    let mut page = PageOutcome::new("https://example.com/books".to_string());
    page.status_code = 200;
    page.records_found = 12;
    let outcome = CrawlOutcome {
        session_id: "s-1".to_string(),
        records: Vec::new(),
        pages: vec![page],
        budget_exhausted: false,
    };

    let report = generate_crawl_report(&outcome);

    assert!(report.contains("Pages crawled: 1"));
    assert!(report.contains("## example.com"));
    assert!(report.contains("/books (12 record(s))"));
    assert!(!report.contains("Page budget exhausted"));
}
