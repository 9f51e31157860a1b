use super::fields::{element_text, resolve_url};
use super::strategy::parse_selector;
use crate::error::Result;
use scraper::{Html, Selector};
use url::Url;

const NEXT_SELECTORS: &[&str] = &[
    "link[rel~='next'][href]",
    "a[rel~='next'][href]",
    ".pagination a.next[href]",
    ".pagination__next[href]",
    "li.next a[href]",
    "a.next[href]",
    "a[aria-label='Next'][href]",
    "a[aria-label='Next page'][href]",
];

const NEXT_TEXTS: &[&str] = &["next", "next page", "next ›", "next »", "›", "»", ">"];

/// Finds "next page" links on listing pages.
pub struct PaginationScanner {
    explicit: Vec<Selector>,
    anchors: Selector,
}

impl PaginationScanner {
    pub fn new() -> Result<Self> {
        let explicit = NEXT_SELECTORS
            .iter()
            .map(|s| parse_selector("pagination", s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            explicit,
            anchors: parse_selector("pagination", "a[href]")?,
        })
    }

    /// Same-host next-page URLs, in discovery order, without duplicates.
    pub fn next_links(&self, document: &Html, page_url: &Url) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut push = |url: Url| {
            if url.host_str() != page_url.host_str() || url == *page_url {
                return;
            }
            let url = url.to_string();
            if !found.contains(&url) {
                found.push(url);
            }
        };

        for selector in &self.explicit {
            for element in document.select(selector) {
                if let Some(href) = element.value().attr("href")
                    && let Some(url) = resolve_url(page_url, href)
                {
                    push(url);
                }
            }
        }

        // Past the last representable page number there is nothing to match.
        let wanted_page = current_page(page_url).checked_add(1);
        for element in document.select(&self.anchors) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_url(page_url, href) else {
                continue;
            };
            let text = element_text(element).to_lowercase();
            let is_next_number = wanted_page.is_some() && page_param(&url) == wanted_page;
            if NEXT_TEXTS.contains(&text.as_str()) || is_next_number {
                push(url);
            }
        }

        found
    }
}

fn page_param(url: &Url) -> Option<u32> {
    url.query_pairs()
        .find(|(key, _)| key == "page" || key == "p")
        .and_then(|(_, value)| value.parse().ok())
}

fn current_page(url: &Url) -> u32 {
    page_param(url).unwrap_or(1)
}
