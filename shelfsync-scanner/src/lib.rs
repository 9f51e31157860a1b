pub mod backoff;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod result;

pub use backoff::RetryPolicy;
pub use crawler::{CrawlConfig, CrawlEvent, Crawler, ProgressCallback};
pub use error::{ExtractError, FetchError, ScanError};
pub use extract::{Extractor, Page, StrategyBook};
pub use fetch::{ReqwestTransport, Transport, UserAgentPool};
pub use result::{CrawlOutcome, PageOutcome, ProductRecord, Record, RecordKind};
