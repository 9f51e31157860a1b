use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which kind of record a page is expected to yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Navigation,
    Category,
    Product,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Navigation => "navigation",
            RecordKind::Category => "category",
            RecordKind::Product => "product",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "navigation" | "nav" => Ok(RecordKind::Navigation),
            "category" | "categories" => Ok(RecordKind::Category),
            "product" | "products" => Ok(RecordKind::Product),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "GBP")]
    Gbp,
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "EUR")]
    Eur,
    #[serde(rename = "JPY")]
    Jpy,
    #[serde(rename = "INR")]
    Inr,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Gbp => "GBP",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Jpy => "JPY",
            Currency::Inr => "INR",
        }
    }

    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '£' => Some(Currency::Gbp),
            '$' => Some(Currency::Usd),
            '€' => Some(Currency::Eur),
            '¥' => Some(Currency::Jpy),
            '₹' => Some(Currency::Inr),
            _ => None,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "GBP" => Some(Currency::Gbp),
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            "JPY" => Some(Currency::Jpy),
            "INR" => Some(Currency::Inr),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Non-negative amount with its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: Decimal,
    pub currency: Currency,
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationHeading {
    pub title: String,
    pub slug: String,
    pub source_url: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub title: String,
    pub slug: String,
    pub parent_slug: Option<String>,
    pub source_url: String,
    pub item_count: Option<u32>,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub price: Option<Price>,
    pub image_url: Option<String>,
    pub proxied_image_url: Option<String>,
    pub source_url: Option<String>,
    pub available: bool,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
}

impl ProductRecord {
    /// Source URL when known, otherwise the derived id.
    pub fn identity(&self) -> &str {
        self.source_url.as_deref().unwrap_or(&self.id)
    }
}

/// One normalized record emitted by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Navigation(NavigationHeading),
    Category(CategoryNode),
    Product(ProductRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Navigation(_) => RecordKind::Navigation,
            Record::Category(_) => RecordKind::Category,
            Record::Product(_) => RecordKind::Product,
        }
    }

    /// Dedup key within a crawl session.
    pub fn identity(&self) -> String {
        match self {
            Record::Navigation(heading) => format!("navigation:{}", heading.slug),
            Record::Category(category) => format!(
                "category:{}/{}",
                category.parent_slug.as_deref().unwrap_or(""),
                category.slug
            ),
            Record::Product(product) => format!("product:{}", product.identity()),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Record::Navigation(heading) => &heading.title,
            Record::Category(category) => &category.title,
            Record::Product(product) => &product.title,
        }
    }

    pub fn source_url(&self) -> Option<&str> {
        match self {
            Record::Navigation(heading) => Some(&heading.source_url),
            Record::Category(category) => Some(&category.source_url),
            Record::Product(product) => product.source_url.as_deref(),
        }
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        match self {
            Record::Navigation(heading) => heading.acquired_at,
            Record::Category(category) => category.acquired_at,
            Record::Product(product) => product.acquired_at,
        }
    }

    pub fn as_product(&self) -> Option<&ProductRecord> {
        match self {
            Record::Product(product) => Some(product),
            _ => None,
        }
    }
}

/// Per-page outcome within a crawl session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOutcome {
    pub url: String,
    pub status_code: u16,
    pub records_found: usize,
    pub next_links: Vec<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl PageOutcome {
    pub fn new(url: String) -> Self {
        Self {
            url,
            status_code: 0,
            records_found: 0,
            next_links: Vec::new(),
            attempts: 0,
            error: None,
        }
    }

    pub fn with_error(url: String, error: String, attempts: u32) -> Self {
        Self {
            url,
            status_code: 0,
            records_found: 0,
            next_links: Vec::new(),
            attempts,
            error: Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Everything a crawl session collected. Partial results are normal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlOutcome {
    pub session_id: String,
    pub records: Vec<Record>,
    pub pages: Vec<PageOutcome>,
    pub budget_exhausted: bool,
}

impl CrawlOutcome {
    pub fn pages_failed(&self) -> usize {
        self.pages.iter().filter(|p| p.is_failure()).count()
    }

    pub fn pages_succeeded(&self) -> usize {
        self.pages.len() - self.pages_failed()
    }

    pub fn products(&self) -> impl Iterator<Item = &ProductRecord> {
        self.records.iter().filter_map(Record::as_product)
    }
}
