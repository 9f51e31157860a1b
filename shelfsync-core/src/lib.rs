pub mod config;
pub mod crawl;
pub mod data;
pub mod image;
pub mod refresh;
pub mod report;
pub mod security;

pub use config::{ConfigError, Settings};
pub use data::{CatalogError, Database};
pub use image::{ImageError, ImageProxy, ImageSettings};
pub use refresh::{
    Acquirer, CatalogStore, CrawlAcquirer, EntitySetKey, RefreshState, Snapshot,
    StalenessController,
};
pub use security::{UrlValidator, ValidationError};

use colored::Colorize;

pub fn print_banner() {
    println!(
        "{} {}",
        "shelfsync".bright_cyan().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
    println!("{}", "catalog sync, image proxy, stale-while-revalidate".bright_black());
    println!();
}
