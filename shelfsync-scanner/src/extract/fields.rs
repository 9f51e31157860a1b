use chrono::Utc;
use scraper::{ElementRef, Selector};
use std::collections::{HashMap, HashSet};
use url::Url;

/// Inclusive character-length window for accepted text fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthWindow {
    pub min: usize,
    pub max: usize,
}

impl LengthWindow {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn accepts(&self, text: &str) -> bool {
        let len = text.chars().count();
        len >= self.min.max(1) && len <= self.max
    }
}

pub const TITLE_WINDOW: LengthWindow = LengthWindow::new(2, 300);
pub const AUTHOR_WINDOW: LengthWindow = LengthWindow::new(1, 150);
pub const LOOSE_WINDOW: LengthWindow = LengthWindow::new(1, 500);

/// Element text with whitespace runs collapsed to single spaces.
pub fn element_text(element: ElementRef) -> String {
    let mut out = String::new();
    for chunk in element.text() {
        for word in chunk.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
    }
    out
}

/// First sub-selector match whose text fits the window.
pub fn first_text(
    container: ElementRef,
    selectors: &[Selector],
    window: LengthWindow,
) -> Option<String> {
    for selector in selectors {
        for element in container.select(selector) {
            let text = element_text(element);
            if window.accepts(&text) {
                return Some(text);
            }
        }
    }
    None
}

/// First non-empty value of any of `attrs` on a sub-selector match.
pub fn first_attr(container: ElementRef, selectors: &[Selector], attrs: &[&str]) -> Option<String> {
    for selector in selectors {
        for element in container.select(selector) {
            for attr in attrs {
                if let Some(value) = element.value().attr(attr).map(str::trim)
                    && !value.is_empty()
                {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Image source from `src`, lazy-load attributes or the first `srcset` entry.
pub fn image_source(container: ElementRef, selectors: &[Selector]) -> Option<String> {
    for selector in selectors {
        for element in container.select(selector) {
            let el = element.value();
            for attr in ["src", "data-src", "data-lazy-src", "data-original"] {
                if let Some(value) = el.attr(attr).map(str::trim)
                    && !value.is_empty()
                    && !value.starts_with("data:")
                {
                    return Some(value.to_string());
                }
            }
            if let Some(srcset) = el.attr("srcset").or_else(|| el.attr("data-srcset"))
                && let Some(first) = srcset
                    .split(',')
                    .next()
                    .and_then(|candidate| candidate.split_whitespace().next())
                && !first.is_empty()
            {
                return Some(first.to_string());
            }
        }
    }
    None
}

/// Resolve an href against the page URL, dropping fragments and
/// non-navigable schemes.
pub fn resolve_url(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:")
    {
        return None;
    }

    let mut resolved = base.join(href).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

/// First integer in a string such as "(1,204 items)".
pub fn parse_count(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Lowercase ASCII alphanumerics joined by single hyphens.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            slug.push(c.to_ascii_lowercase());
            pending_hyphen = false;
        } else if c == '&' {
            if !slug.is_empty() {
                slug.push_str("-and");
            }
            pending_hyphen = true;
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Hands out slugs that are unique within a scope.
#[derive(Debug, Default)]
pub struct SlugRegistry {
    claimed: HashMap<String, HashSet<String>>,
}

impl SlugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, scope: &str, title: &str) -> String {
        let base = match slugify(title) {
            s if s.is_empty() => "untitled".to_string(),
            s => s,
        };
        let taken = self.claimed.entry(scope.to_string()).or_default();
        if taken.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Stable product id: last path segment of the product URL, a
/// timestamp-based id when the URL has no usable segment, or a slug of
/// title and author when there is no URL at all.
pub fn derive_product_id(url: Option<&Url>, title: &str, author: Option<&str>, index: usize) -> String {
    match url {
        Some(url) => url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
            .map(|segment| segment.to_string())
            .unwrap_or_else(|| format!("item-{}-{}", Utc::now().timestamp_millis(), index)),
        None => {
            let basis = match author {
                Some(author) => format!("{title} {author}"),
                None => title.to_string(),
            };
            format!("item-{}", slugify(&basis))
        }
    }
}
