use crate::error::{Result, ScanError};
use crate::result::RecordKind;
use scraper::Selector;
use serde::{Deserialize, Serialize};

/// Ordered sub-selectors for each field of a record, evaluated relative to
/// the strategy's container element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelectors {
    pub title: Vec<String>,
    pub link: Vec<String>,
    pub author: Vec<String>,
    pub price: Vec<String>,
    pub image: Vec<String>,
    pub count: Vec<String>,
    pub sold_out: Vec<String>,
    pub specs: Vec<String>,
}

/// One way of locating records on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorStrategy {
    pub name: String,
    pub container: String,
    #[serde(default = "default_min_matches")]
    pub min_matches: usize,
    #[serde(default)]
    pub fields: FieldSelectors,
}

fn default_min_matches() -> usize {
    1
}

/// Strategies per record kind, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyBook {
    pub navigation: Vec<SelectorStrategy>,
    pub category: Vec<SelectorStrategy>,
    pub product: Vec<SelectorStrategy>,
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl SelectorStrategy {
    pub fn new(name: &str, container: &str, min_matches: usize, fields: FieldSelectors) -> Self {
        Self {
            name: name.to_string(),
            container: container.to_string(),
            min_matches,
            fields,
        }
    }
}

impl Default for StrategyBook {
    fn default() -> Self {
        let navigation = vec![
            SelectorStrategy::new(
                "header-menu",
                "header nav .menu-item > a[href], header nav .nav-item > a[href], nav.main-nav > ul > li > a[href]",
                2,
                FieldSelectors::default(),
            ),
            SelectorStrategy::new(
                "nav-links",
                "nav a[href]",
                2,
                FieldSelectors::default(),
            ),
            SelectorStrategy::new(
                "header-links",
                "header a[href]",
                3,
                FieldSelectors::default(),
            ),
        ];

        let category = vec![
            SelectorStrategy::new(
                "category-cards",
                ".category-card, .category-tile, [data-category]",
                1,
                FieldSelectors {
                    title: strs(&[".category-title", ".category-card__title", "h2", "h3", ".title", "a"]),
                    link: strs(&["a[href]"]),
                    count: strs(&[".product-count", ".item-count", ".count"]),
                    ..FieldSelectors::default()
                },
            ),
            SelectorStrategy::new(
                "category-list",
                ".categories li, .category-list li, aside .facet-list li",
                2,
                FieldSelectors {
                    title: strs(&["a"]),
                    link: strs(&["a[href]"]),
                    count: strs(&[".count", "span"]),
                    ..FieldSelectors::default()
                },
            ),
            SelectorStrategy::new(
                "collection-links",
                "main a[href*='/collections/'], main a[href*='/category/'], a[href*='/collections/']",
                1,
                FieldSelectors::default(),
            ),
        ];

        let product = vec![
            SelectorStrategy::new(
                "product-card",
                ".product-card, .product-item, [data-product-id]",
                1,
                FieldSelectors {
                    title: strs(&[".product-title", ".product-card__title", ".title", "h3", "h2"]),
                    link: strs(&["a.product-link[href]", ".product-title a[href]", "h3 a[href]", "a[href]"]),
                    author: strs(&[".author", ".product-author", "[itemprop='author']", ".vendor"]),
                    price: strs(&[".price-now", ".price .sale", ".sale-price", ".price", "[itemprop='price']"]),
                    image: strs(&["img.product-image", "img"]),
                    sold_out: strs(&[".sold-out", ".out-of-stock", "[data-available='false']"]),
                    specs: strs(&["dl", "table.specs", "table"]),
                    ..FieldSelectors::default()
                },
            ),
            SelectorStrategy::new(
                "schema-product",
                "[itemtype*='schema.org/Product']",
                1,
                FieldSelectors {
                    title: strs(&["[itemprop='name']"]),
                    link: strs(&["a[itemprop='url'][href]", "a[href]"]),
                    author: strs(&["[itemprop='author']", "[itemprop='brand']"]),
                    price: strs(&["[itemprop='price']", "[itemprop='offers']"]),
                    image: strs(&["img[itemprop='image']", "img"]),
                    sold_out: strs(&["link[href*='OutOfStock']", "[href*='OutOfStock']"]),
                    specs: strs(&["dl", "table"]),
                    ..FieldSelectors::default()
                },
            ),
            SelectorStrategy::new(
                "grid-items",
                "ul.products > li, .grid__item, article",
                2,
                FieldSelectors {
                    title: strs(&["h3", "h2", "h4", "a"]),
                    link: strs(&["a[href]"]),
                    author: strs(&[".author", ".byline"]),
                    price: strs(&[".price", ".amount"]),
                    image: strs(&["img"]),
                    sold_out: strs(&[".sold-out", ".out-of-stock"]),
                    ..FieldSelectors::default()
                },
            ),
        ];

        Self {
            navigation,
            category,
            product,
        }
    }
}

impl StrategyBook {
    pub fn strategies(&self, kind: RecordKind) -> &[SelectorStrategy] {
        match kind {
            RecordKind::Navigation => &self.navigation,
            RecordKind::Category => &self.category,
            RecordKind::Product => &self.product,
        }
    }
}

pub(crate) struct CompiledFields {
    pub title: Vec<Selector>,
    pub link: Vec<Selector>,
    pub author: Vec<Selector>,
    pub price: Vec<Selector>,
    pub image: Vec<Selector>,
    pub count: Vec<Selector>,
    pub sold_out: Vec<Selector>,
    pub specs: Vec<Selector>,
}

pub(crate) struct CompiledStrategy {
    pub name: String,
    pub container: Selector,
    pub min_matches: usize,
    pub fields: CompiledFields,
}

pub(crate) fn parse_selector(strategy: &str, selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| ScanError::InvalidSelector {
        strategy: strategy.to_string(),
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn parse_all(strategy: &str, selectors: &[String]) -> Result<Vec<Selector>> {
    selectors
        .iter()
        .map(|s| parse_selector(strategy, s))
        .collect()
}

impl CompiledStrategy {
    pub fn compile(strategy: &SelectorStrategy) -> Result<Self> {
        let name = strategy.name.as_str();
        let fields = &strategy.fields;
        Ok(Self {
            name: strategy.name.clone(),
            container: parse_selector(name, &strategy.container)?,
            min_matches: strategy.min_matches.max(1),
            fields: CompiledFields {
                title: parse_all(name, &fields.title)?,
                link: parse_all(name, &fields.link)?,
                author: parse_all(name, &fields.author)?,
                price: parse_all(name, &fields.price)?,
                image: parse_all(name, &fields.image)?,
                count: parse_all(name, &fields.count)?,
                sold_out: parse_all(name, &fields.sold_out)?,
                specs: parse_all(name, &fields.specs)?,
            },
        })
    }

    pub fn compile_all(strategies: &[SelectorStrategy]) -> Result<Vec<Self>> {
        strategies.iter().map(Self::compile).collect()
    }
}
