//! Structured extraction of catalog records from listing pages.
//!
//! Each record kind has an ordered list of selector strategies. The first
//! strategy whose container count reaches its threshold wins and is the only
//! one used for that page, so records from differently shaped page variants
//! never mix.

mod fields;
mod pagination;
mod price;
mod strategy;

pub use fields::{
    AUTHOR_WINDOW, LengthWindow, SlugRegistry, TITLE_WINDOW, derive_product_id, resolve_url,
    slugify,
};
pub use pagination::PaginationScanner;
pub use price::parse_price;
pub use strategy::{FieldSelectors, SelectorStrategy, StrategyBook};

use crate::error::{ExtractError, Result};
use crate::result::{CategoryNode, NavigationHeading, ProductRecord, Record, RecordKind};
use chrono::{DateTime, Utc};
use fields::{
    LOOSE_WINDOW, element_text, first_attr, first_text, image_source, parse_count,
};
use indexmap::IndexMap;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use strategy::CompiledStrategy;
use tracing::debug;
use url::Url;

const SOLD_OUT_PHRASES: &[&str] = &["out of stock", "sold out", "currently unavailable"];

/// A fetched page ready for extraction.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub html: String,
    pub parent_slug: Option<String>,
}

impl Page {
    pub fn new(url: Url, html: impl Into<String>) -> Self {
        Self {
            url,
            html: html.into(),
            parent_slug: None,
        }
    }

    pub fn with_parent(mut self, parent_slug: impl Into<String>) -> Self {
        self.parent_slug = Some(parent_slug.into());
        self
    }
}

/// Records plus pagination links found on one page.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub strategy: Option<String>,
    pub records: Vec<Record>,
    pub next_links: Vec<String>,
}

pub struct Extractor {
    navigation: Vec<CompiledStrategy>,
    category: Vec<CompiledStrategy>,
    product: Vec<CompiledStrategy>,
    pagination: PaginationScanner,
}

impl Extractor {
    pub fn new(book: &StrategyBook) -> Result<Self> {
        Ok(Self {
            navigation: CompiledStrategy::compile_all(&book.navigation)?,
            category: CompiledStrategy::compile_all(&book.category)?,
            product: CompiledStrategy::compile_all(&book.product)?,
            pagination: PaginationScanner::new()?,
        })
    }

    fn strategies(&self, kind: RecordKind) -> &[CompiledStrategy] {
        match kind {
            RecordKind::Navigation => &self.navigation,
            RecordKind::Category => &self.category,
            RecordKind::Product => &self.product,
        }
    }

    /// Records of `kind` on the page. Never fails: a page without any
    /// recognizable structure yields an empty list.
    pub fn extract(&self, page: &Page, kind: RecordKind) -> Vec<Record> {
        self.scan(page, kind).records
    }

    /// Records and next-page links, parsing the document once.
    pub fn scan(&self, page: &Page, kind: RecordKind) -> PageExtraction {
        if page.html.trim().is_empty() {
            debug!("Empty body for {}", page.url);
            return PageExtraction::default();
        }

        let document = Html::parse_document(&page.html);
        let acquired_at = Utc::now();
        let next_links = self.pagination.next_links(&document, &page.url);

        for strategy in self.strategies(kind) {
            let containers: Vec<ElementRef> = document.select(&strategy.container).collect();
            if containers.len() < strategy.min_matches {
                debug!(
                    "Strategy '{}' matched {} container(s) on {} (needs {})",
                    strategy.name,
                    containers.len(),
                    page.url,
                    strategy.min_matches
                );
                continue;
            }

            debug!(
                "Strategy '{}' won on {} with {} container(s)",
                strategy.name,
                page.url,
                containers.len()
            );
            let records = build_records(strategy, &containers, page, kind, acquired_at);
            return PageExtraction {
                strategy: Some(strategy.name.clone()),
                records,
                next_links,
            };
        }

        debug!("No {} strategy matched {}", kind, page.url);
        PageExtraction {
            strategy: None,
            records: Vec::new(),
            next_links,
        }
    }
}

fn build_records(
    strategy: &CompiledStrategy,
    containers: &[ElementRef],
    page: &Page,
    kind: RecordKind,
    acquired_at: DateTime<Utc>,
) -> Vec<Record> {
    let mut slugs = SlugRegistry::new();
    let mut records: IndexMap<String, Record> = IndexMap::new();

    for (index, container) in containers.iter().enumerate() {
        let built = match kind {
            RecordKind::Navigation => {
                build_navigation(strategy, *container, page, &mut slugs, acquired_at)
            }
            RecordKind::Category => {
                build_category(strategy, *container, page, &mut slugs, acquired_at)
            }
            RecordKind::Product => build_product(strategy, *container, page, index, acquired_at),
        };

        match built {
            Ok(record) => {
                records.entry(record.identity()).or_insert(record);
            }
            Err(err) => {
                debug!(
                    "Skipping {} element {} on {}: {}",
                    kind, index, page.url, err
                );
            }
        }
    }

    records.into_values().collect()
}

fn container_title(strategy: &CompiledStrategy, container: ElementRef) -> Option<String> {
    if strategy.fields.title.is_empty() {
        let text = element_text(container);
        return TITLE_WINDOW.accepts(&text).then_some(text);
    }
    first_text(container, &strategy.fields.title, TITLE_WINDOW)
}

fn container_link(strategy: &CompiledStrategy, container: ElementRef, page: &Page) -> Option<Url> {
    let href = first_attr(container, &strategy.fields.link, &["href"]).or_else(|| {
        (container.value().name() == "a")
            .then(|| container.value().attr("href").map(str::to_string))
            .flatten()
    })?;
    resolve_url(&page.url, &href)
}

fn build_navigation(
    strategy: &CompiledStrategy,
    container: ElementRef,
    page: &Page,
    slugs: &mut SlugRegistry,
    acquired_at: DateTime<Utc>,
) -> std::result::Result<Record, ExtractError> {
    let title = container_title(strategy, container).ok_or(ExtractError::MissingTitle)?;
    let link = container_link(strategy, container, page).ok_or(ExtractError::MissingLink)?;
    let slug = slugs.claim("", &title);

    Ok(Record::Navigation(NavigationHeading {
        title,
        slug,
        source_url: link.to_string(),
        acquired_at,
    }))
}

fn build_category(
    strategy: &CompiledStrategy,
    container: ElementRef,
    page: &Page,
    slugs: &mut SlugRegistry,
    acquired_at: DateTime<Utc>,
) -> std::result::Result<Record, ExtractError> {
    let title = container_title(strategy, container).ok_or(ExtractError::MissingTitle)?;
    let link = container_link(strategy, container, page).ok_or(ExtractError::MissingLink)?;
    let scope = page.parent_slug.as_deref().unwrap_or("");
    let slug = slugs.claim(scope, &title);
    let item_count =
        first_text(container, &strategy.fields.count, LOOSE_WINDOW).and_then(|t| parse_count(&t));

    Ok(Record::Category(CategoryNode {
        title,
        slug,
        parent_slug: page.parent_slug.clone(),
        source_url: link.to_string(),
        item_count,
        acquired_at,
    }))
}

fn build_product(
    strategy: &CompiledStrategy,
    container: ElementRef,
    page: &Page,
    index: usize,
    acquired_at: DateTime<Utc>,
) -> std::result::Result<Record, ExtractError> {
    let fields = &strategy.fields;
    let title = container_title(strategy, container).ok_or(ExtractError::MissingTitle)?;
    let author = first_text(container, &fields.author, AUTHOR_WINDOW);
    let link = container_link(strategy, container, page);
    let price = price_text(container, &fields.price).and_then(|t| parse_price(&t));
    let image_url = image_source(container, &fields.image)
        .and_then(|src| resolve_url(&page.url, &src))
        .map(|url| url.to_string());

    let id = derive_product_id(link.as_ref(), &title, author.as_deref(), index);

    Ok(Record::Product(ProductRecord {
        id,
        title,
        author,
        price,
        image_url,
        proxied_image_url: None,
        source_url: link.map(|url| url.to_string()),
        available: is_available(container, &fields.sold_out),
        acquired_at,
        specs: spec_map(container, &fields.specs),
    }))
}

fn price_text(container: ElementRef, selectors: &[Selector]) -> Option<String> {
    // itemprop=price often carries the value in `content`
    first_attr(container, selectors, &["content"])
        .filter(|v| v.chars().any(|c| c.is_ascii_digit()))
        .or_else(|| first_text(container, selectors, LOOSE_WINDOW))
}

fn is_available(container: ElementRef, sold_out: &[Selector]) -> bool {
    if sold_out.iter().any(|s| container.select(s).next().is_some()) {
        return false;
    }
    let text = element_text(container).to_lowercase();
    !SOLD_OUT_PHRASES.iter().any(|phrase| text.contains(phrase))
}

fn spec_map(container: ElementRef, selectors: &[Selector]) -> BTreeMap<String, String> {
    let mut specs = BTreeMap::new();
    for selector in selectors {
        for block in container.select(selector) {
            match block.value().name() {
                "dl" => collect_definition_list(block, &mut specs),
                "table" => collect_table_rows(block, &mut specs),
                _ => {}
            }
        }
        if !specs.is_empty() {
            break;
        }
    }
    specs
}

fn collect_definition_list(list: ElementRef, specs: &mut BTreeMap<String, String>) {
    let mut key: Option<String> = None;
    for child in list.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "dt" => key = Some(element_text(child)),
            "dd" => {
                if let Some(k) = key.take()
                    && !k.is_empty()
                {
                    specs.insert(k.trim_end_matches(':').to_string(), element_text(child));
                }
            }
            _ => {}
        }
    }
}

fn collect_table_rows(table: ElementRef, specs: &mut BTreeMap<String, String>) {
    let Ok(rows) = Selector::parse("tr") else {
        return;
    };
    let Ok(cells) = Selector::parse("th, td") else {
        return;
    };
    for row in table.select(&rows) {
        let values: Vec<String> = row.select(&cells).map(element_text).collect();
        if let [key, value] = values.as_slice()
            && !key.is_empty()
        {
            specs.insert(key.trim_end_matches(':').to_string(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Currency;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn extractor() -> Extractor {
        Extractor::new(&StrategyBook::default()).unwrap()
    }

    fn page(url: &str, html: &str) -> Page {
        Page::new(Url::parse(url).unwrap(), html)
    }

    #[test]
    fn test_navigation_from_header_menu() {
        let html = r#"<html><body><header><nav>
            <ul>
              <li class="menu-item"><a href="/fiction">Fiction</a></li>
              <li class="menu-item"><a href="/non-fiction">Non-Fiction</a></li>
              <li class="menu-item"><a href="https://shop.example/kids">Children's Books</a></li>
            </ul>
        </nav></header></body></html>"#;

        let records = extractor().extract(&page("https://shop.example/", html), RecordKind::Navigation);
        assert_eq!(records.len(), 3);
        let Record::Navigation(first) = &records[0] else {
            panic!("expected navigation record");
        };
        assert_eq!(first.title, "Fiction");
        assert_eq!(first.slug, "fiction");
        assert_eq!(first.source_url, "https://shop.example/fiction");
    }

    #[test]
    fn test_category_counts_and_parent() {
        let html = r#"<div class="category-card"><a href="/c/crime"><h3>Crime</h3></a><span class="count">(1,204)</span></div>
                      <div class="category-card"><a href="/c/horror"><h3>Horror</h3></a></div>"#;
        let page = page("https://shop.example/c/fiction", html).with_parent("fiction");
        let records = extractor().extract(&page, RecordKind::Category);

        assert_eq!(records.len(), 2);
        let Record::Category(crime) = &records[0] else {
            panic!("expected category record");
        };
        assert_eq!(crime.slug, "crime");
        assert_eq!(crime.parent_slug.as_deref(), Some("fiction"));
        assert_eq!(crime.item_count, Some(1204));
        assert_eq!(crime.source_url, "https://shop.example/c/crime");
    }

    #[test]
    fn test_product_fields() {
        let html = r#"<div class="product-card">
            <a class="product-link" href="/products/dune-9780340960196"><img src="/img/dune.jpg"></a>
            <h3 class="product-title">Dune</h3>
            <p class="author">Frank Herbert</p>
            <span class="price">£12.99 (was £15.00)</span>
            <dl><dt>Format:</dt><dd>Paperback</dd><dt>Pages</dt><dd>896</dd></dl>
        </div>"#;
        let records = extractor().extract(&page("https://shop.example/books", html), RecordKind::Product);

        assert_eq!(records.len(), 1);
        let product = records[0].as_product().unwrap();
        assert_eq!(product.id, "dune-9780340960196");
        assert_eq!(product.title, "Dune");
        assert_eq!(product.author.as_deref(), Some("Frank Herbert"));
        let price = product.price.as_ref().unwrap();
        assert_eq!(price.amount, Decimal::from_str("12.99").unwrap());
        assert_eq!(price.currency, Currency::Gbp);
        assert_eq!(
            product.image_url.as_deref(),
            Some("https://shop.example/img/dune.jpg")
        );
        assert_eq!(
            product.source_url.as_deref(),
            Some("https://shop.example/products/dune-9780340960196")
        );
        assert!(product.available);
        assert_eq!(product.specs.get("Format").map(String::as_str), Some("Paperback"));
        assert_eq!(product.specs.get("Pages").map(String::as_str), Some("896"));
    }

    #[test]
    fn test_sold_out_detection() {
        let html = r#"<div class="product-card"><a href="/p/a"><h3>Book A</h3></a><span class="sold-out">Sold</span></div>
                      <div class="product-card"><a href="/p/b"><h3>Book B</h3></a><p>Currently unavailable</p></div>
                      <div class="product-card"><a href="/p/c"><h3>Book C</h3></a></div>"#;
        let records = extractor().extract(&page("https://shop.example/", html), RecordKind::Product);
        let availability: Vec<bool> = records
            .iter()
            .filter_map(Record::as_product)
            .map(|p| p.available)
            .collect();
        assert_eq!(availability, vec![false, false, true]);
    }

    #[test]
    fn test_fallback_strategy_first_match_wins() {
        // no product-card or schema markup; three grid items
        let html = r#"<ul class="products">
            <li><a href="/p/one"><h3>First Book</h3></a><span class="price">$5</span></li>
            <li><a href="/p/two"><h3>Second Book</h3></a><span class="price">$6</span></li>
            <li><a href="/p/three"><h3>Third Book</h3></a><span class="price">$7</span></li>
        </ul>"#;
        let scan = extractor().scan(&page("https://shop.example/", html), RecordKind::Product);
        assert_eq!(scan.strategy.as_deref(), Some("grid-items"));
        assert_eq!(scan.records.len(), 3);
    }

    #[test]
    fn test_winning_strategy_excludes_later_ones() {
        // one product-card plus grid items: only the product-card is used
        let html = r#"<div class="product-card"><a href="/p/card"><h3>Card Book</h3></a></div>
            <ul class="products">
              <li><a href="/p/one"><h3>First Book</h3></a></li>
              <li><a href="/p/two"><h3>Second Book</h3></a></li>
            </ul>"#;
        let records = extractor().extract(&page("https://shop.example/", html), RecordKind::Product);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title(), "Card Book");
    }

    #[test]
    fn test_bad_element_skipped_not_fatal() {
        let html = r#"<div class="product-card"><a href="/p/ok"><h3>Good Book</h3></a></div>
                      <div class="product-card"><a href="/p/empty"></a></div>"#;
        let records = extractor().extract(&page("https://shop.example/", html), RecordKind::Product);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_duplicate_products_collapse() {
        let html = r#"<div class="product-card"><a href="/p/same"><h3>Same Book</h3></a></div>
                      <div class="product-card"><a href="/p/same#x"><h3>Same Book again</h3></a></div>"#;
        let records = extractor().extract(&page("https://shop.example/", html), RecordKind::Product);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title(), "Same Book");
    }

    #[test]
    fn test_unstructured_page_is_empty() {
        let records = extractor().extract(
            &page("https://shop.example/", "<html><body><p>Maintenance</p></body></html>"),
            RecordKind::Product,
        );
        assert!(records.is_empty());
        assert!(extractor().extract(&page("https://shop.example/", "   "), RecordKind::Category).is_empty());
    }

    #[test]
    fn test_oversized_title_rejected() {
        let long = "x".repeat(400);
        let html = format!(
            r#"<div class="product-card"><a href="/p/long"><h3>{long}</h3></a></div>"#
        );
        let records = extractor().extract(&page("https://shop.example/", &html), RecordKind::Product);
        assert!(records.is_empty());
    }
}
