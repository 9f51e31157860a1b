use super::cache::{CacheStats, ImageCache};
use super::sniff::sniff_image;
use crate::security::{ProxySignature, UrlValidator, ValidationError, unwrap_proxy_target};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shelfsync_scanner::backoff::RetryPolicy;
use shelfsync_scanner::error::FetchError;
use shelfsync_scanner::fetch::{ACCEPT_IMAGE, Transport, TransportRequest, UserAgentPool};
use shelfsync_scanner::result::Record;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub retry: RetryPolicy,
    pub timeout_secs: u64,
    pub min_bytes: usize,
    pub max_bytes: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    pub warm_concurrency: usize,
    /// Prefix for client-facing proxy URLs, e.g. `https://shop.example`.
    pub public_base: String,
    pub signature: ProxySignature,
    pub max_unwraps: usize,
    pub max_redirects: usize,
    pub resolve_dns: bool,
    pub allow_hosts: Vec<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(4, 1_000, 8_000),
            timeout_secs: 10,
            min_bytes: 100,
            max_bytes: 10 * 1024 * 1024,
            cache_ttl_secs: 24 * 60 * 60,
            cache_max_entries: 500,
            cache_max_bytes: 200 * 1024 * 1024,
            warm_concurrency: 4,
            public_base: String::new(),
            signature: ProxySignature::default(),
            max_unwraps: 5,
            max_redirects: 5,
            resolve_dns: false,
            allow_hosts: Vec::new(),
        }
    }
}

impl ImageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn validator(&self) -> UrlValidator {
        self.allow_hosts
            .iter()
            .fold(UrlValidator::new(), |v, host| v.allow_host(host.as_str()))
            .with_dns_check(self.resolve_dns)
    }
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("rejected image URL: {0}")]
    Validation(#[from] ValidationError),

    #[error("{url} is not a supported image type")]
    UnsupportedType { url: String },

    #[error("failed to download {url} after {attempts} attempt(s): {source}")]
    Fetch {
        url: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub bytes: Arc<[u8]>,
    pub mime_type: &'static str,
    pub size: usize,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub requested: usize,
    pub downloaded: usize,
    pub already_cached: usize,
    pub failed: usize,
    /// Expired entries dropped before warming.
    pub expired: usize,
}

/// Validates, downloads, sniffs and caches external images.
pub struct ImageProxy {
    transport: Arc<dyn Transport>,
    validator: UrlValidator,
    cache: ImageCache,
    agents: UserAgentPool,
    settings: ImageSettings,
}

impl ImageProxy {
    pub fn new(transport: Arc<dyn Transport>, settings: ImageSettings) -> Self {
        let cache = ImageCache::new(
            settings.cache_ttl(),
            settings.cache_max_entries,
            settings.cache_max_bytes,
        );
        Self {
            transport,
            validator: settings.validator(),
            cache,
            agents: UserAgentPool::default(),
            settings,
        }
    }

    pub fn with_validator(mut self, validator: UrlValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_user_agents(mut self, agents: UserAgentPool) -> Self {
        self.agents = agents;
        self
    }

    pub fn settings(&self) -> &ImageSettings {
        &self.settings
    }

    /// Resolve `raw` to a safe original URL: unwrap proxy-of-proxy nesting,
    /// then apply the host policy.
    pub async fn resolve_target(&self, raw: &str) -> Result<Url, ImageError> {
        let target = unwrap_proxy_target(raw, &self.settings.signature, self.settings.max_unwraps)?;
        Ok(self.validator.validate_resolved(&target).await?)
    }

    pub async fn fetch_image(&self, raw: &str) -> Result<ImageResponse, ImageError> {
        let url = self.resolve_target(raw).await?;
        let key = url.as_str();

        if let Some(hit) = self.cache.get(key).await {
            debug!("Image cache hit for {}", key);
            return Ok(ImageResponse {
                mime_type: hit.kind.mime_type(),
                size: hit.size,
                bytes: hit.bytes,
                cache_hit: true,
            });
        }

        let body = self.download(&url).await?;
        let kind = sniff_image(&body).ok_or_else(|| ImageError::UnsupportedType {
            url: key.to_string(),
        })?;

        let bytes: Arc<[u8]> = Arc::from(body);
        self.cache.insert(key, bytes.clone(), kind).await;
        info!("Fetched {} ({}, {} bytes)", key, kind, bytes.len());

        Ok(ImageResponse {
            mime_type: kind.mime_type(),
            size: bytes.len(),
            bytes,
            cache_hit: false,
        })
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, ImageError> {
        let referer = format!("{}/", url.origin().ascii_serialization());

        let retried = self
            .settings
            .retry
            .run(url.as_str(), |_attempt| {
                let request = TransportRequest {
                    url: url.clone(),
                    user_agent: self.agents.next_agent().to_string(),
                    referer: Some(referer.clone()),
                    accept: ACCEPT_IMAGE,
                };
                self.follow(request)
            })
            .await;

        retried.result.map_err(|source| ImageError::Fetch {
            url: url.to_string(),
            attempts: retried.attempts,
            source,
        })
    }

    /// One download attempt. Redirects are followed here rather than by the
    /// transport, and every hop passes the host policy before it is requested.
    async fn follow(&self, mut request: TransportRequest) -> Result<Vec<u8>, FetchError> {
        for _ in 0..=self.settings.max_redirects {
            let response = match self.transport.get(&request).await {
                Ok(response) => response,
                Err(FetchError::Redirect { location, .. }) => {
                    let next = request
                        .url
                        .join(&location)
                        .map_err(|_| FetchError::InvalidUrl(location.clone()))?;
                    let vetted = self
                        .validator
                        .validate_resolved(next.as_str())
                        .await
                        .map_err(|e| {
                            warn!("Refusing redirect from {} to {}: {}", request.url, next, e);
                            FetchError::InvalidUrl(next.to_string())
                        })?;
                    request.url = vetted;
                    debug!("Following image redirect to {}", request.url);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Transports that follow redirects themselves only get an after-the-fact check.
            if let Err(e) = self.validator.validate(response.final_url.as_str()) {
                warn!("Redirect from {} landed on a blocked URL: {}", request.url, e);
                return Err(FetchError::InvalidUrl(response.final_url.to_string()));
            }
            if response.body.len() < self.settings.min_bytes {
                return Err(FetchError::TooSmall {
                    actual: response.body.len(),
                    minimum: self.settings.min_bytes,
                });
            }
            return Ok(response.body);
        }
        Err(FetchError::TooManyRedirects(self.settings.max_redirects))
    }

    /// Fetch many images with bounded concurrency. Failures are only counted.
    pub async fn warm(&self, urls: &[String]) -> WarmReport {
        let concurrency = self.settings.warm_concurrency.max(1);
        let expired = self.cache.purge_expired().await;
        if expired > 0 {
            debug!("Purged {} expired image(s) before warming", expired);
        }
        let outcomes: Vec<Result<ImageResponse, ImageError>> = futures::stream::iter(urls)
            .map(|url| self.fetch_image(url))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = WarmReport {
            requested: urls.len(),
            expired,
            ..WarmReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(response) if response.cache_hit => report.already_cached += 1,
                Ok(_) => report.downloaded += 1,
                Err(e) => {
                    debug!("Warm failure: {}", e);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Cache warm: {} downloaded, {} already cached, {} failed",
            report.downloaded, report.already_cached, report.failed
        );
        report
    }

    /// Client-facing URL that routes `original` through this proxy.
    pub fn proxied_url(&self, original: &str) -> String {
        let signature = &self.settings.signature;
        let target = unwrap_proxy_target(original, signature, self.settings.max_unwraps)
            .unwrap_or_else(|_| original.to_string());
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!(
            "{}{}?{}={}",
            self.settings.public_base.trim_end_matches('/'),
            signature.path,
            signature.param,
            encoded
        )
    }

    /// Point every product's image at the proxy.
    pub fn rewrite_product_images(&self, records: &mut [Record]) -> usize {
        let mut rewritten = 0;
        for record in records.iter_mut() {
            if let Record::Product(product) = record
                && let Some(image) = product.image_url.as_deref()
            {
                product.proxied_image_url = Some(self.proxied_url(image));
                rewritten += 1;
            }
        }
        rewritten
    }

    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache.ttl().as_secs())
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) -> usize {
        self.cache.clear().await
    }
}
