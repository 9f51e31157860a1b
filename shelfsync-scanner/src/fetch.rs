use crate::error::{FetchError, ScanError};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, REFERER, USER_AGENT};
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";
pub const ACCEPT_IMAGE: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub user_agent: String,
    pub referer: Option<String>,
    pub accept: &'static str,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// One GET round-trip. Implementations return `FetchError::Status` for
/// non-2xx responses so callers can decide whether to retry, and
/// `FetchError::Redirect` for a 3xx they chose not to follow.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError>;
}

/// Round-robin over a fixed list of browser user agents.
#[derive(Debug)]
pub struct UserAgentPool {
    agents: Vec<String>,
    next: AtomicUsize,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            agents
        };
        Self {
            agents,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_agent(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        &self.agents[idx]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
    max_bytes: u64,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, ScanError> {
        Self::with_policy(timeout, max_bytes, Policy::limited(5))
    }

    /// A transport that hands every 3xx back to the caller as
    /// `FetchError::Redirect` so each hop can be vetted before it is requested.
    pub fn without_redirects(timeout: Duration, max_bytes: u64) -> Result<Self, ScanError> {
        Self::with_policy(timeout, max_bytes, Policy::none())
    }

    fn with_policy(timeout: Duration, max_bytes: u64, policy: Policy) -> Result<Self, ScanError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(policy)
            .build()
            .map_err(|e| ScanError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    pub fn shared(timeout: Duration, max_bytes: u64) -> Result<Arc<dyn Transport>, ScanError> {
        Ok(Arc::new(Self::new(timeout, max_bytes)?))
    }

    pub fn shared_without_redirects(
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<Arc<dyn Transport>, ScanError> {
        Ok(Arc::new(Self::without_redirects(timeout, max_bytes)?))
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout(self.timeout);
        }
        FetchError::Network(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError> {
        let mut builder = self
            .client
            .get(request.url.clone())
            .header(USER_AGENT, &request.user_agent)
            .header(ACCEPT, request.accept);
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        if status.is_redirection()
            && let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
        {
            return Err(FetchError::Redirect {
                status: status.as_u16(),
                location: location.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(len) = response.content_length()
            && len > self.max_bytes
        {
            return Err(FetchError::Network(format!(
                "response too large ({} bytes, max {})",
                len, self.max_bytes
            )));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        if body.len() as u64 > self.max_bytes {
            return Err(FetchError::Network(format!(
                "response too large ({} bytes, max {})",
                body.len(),
                self.max_bytes
            )));
        }

        Ok(TransportResponse {
            final_url,
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    fn request(url: &str) -> TransportRequest {
        TransportRequest {
            url: Url::parse(url).unwrap(),
            user_agent: "test-agent".to_string(),
            referer: Some("https://shop.example/".to_string()),
            accept: ACCEPT_HTML,
        }
    }

    #[test]
    fn test_user_agents_rotate() {
        let pool = UserAgentPool::new(vec!["a".into(), "b".into()]);
        assert_eq!(pool.next_agent(), "a");
        assert_eq!(pool.next_agent(), "b");
        assert_eq!(pool.next_agent(), "a");
    }

    #[test]
    fn test_empty_pool_falls_back_to_defaults() {
        let pool = UserAgentPool::new(Vec::new());
        assert_eq!(pool.len(), DEFAULT_USER_AGENTS.len());
        assert!(pool.next_agent().starts_with("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn test_sends_agent_and_referer() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("user-agent", "test-agent"))
            .and(header("referer", "https://shop.example/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_bytes(b"<html></html>".as_slice()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5), 1024 * 1024).unwrap();
        let response = transport
            .get(&request(&format!("{}/page", mock_server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type.as_deref(), Some("text/html"));
        assert_eq!(response.body, b"<html></html>");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5), 1024).unwrap();
        let err = transport
            .get(&request(&mock_server.uri()))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Status(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_redirect_is_handed_back_when_not_following() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/elsewhere"))
            .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
            .expect(0)
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::without_redirects(Duration::from_secs(5), 1024).unwrap();
        let err = transport
            .get(&request(&format!("{}/moved", mock_server.uri())))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::Redirect {
                status: 302,
                location: "/elsewhere".to_string()
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(100), 1024).unwrap();
        let err = transport
            .get(&request(&mock_server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
