//! Health check implementations.

use crate::types::{Endpoint, HealthCheckResult, ValidationError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform a health check
    async fn check(&self) -> HealthCheckResult;

    /// Get the name of this checker
    fn name(&self) -> &str;
}

/// Build the checker for a probe target.
pub fn for_endpoint(
    endpoint: &Endpoint,
    timeout_duration: Duration,
) -> Result<Arc<dyn HealthChecker>, ValidationError> {
    match endpoint {
        Endpoint::Tcp(tcp) => {
            let addr = format!("{}:{}", tcp.ip, tcp.port)
                .parse::<SocketAddr>()
                .map_err(|e| ValidationError::Checker(e.to_string()))?;
            Ok(Arc::new(TcpChecker::new(addr, timeout_duration)))
        }
        Endpoint::Http(http) => {
            let checker = HttpChecker::new(http.url(), &http.headers, timeout_duration)
                .map_err(|e| ValidationError::Checker(e.to_string()))?;
            Ok(Arc::new(checker))
        }
    }
}

/// TCP health checker
pub struct TcpChecker {
    target: SocketAddr,
    timeout_duration: Duration,
}

impl TcpChecker {
    /// Create a new TCP health checker
    pub fn new(target: SocketAddr, timeout_duration: Duration) -> Self {
        Self {
            target,
            timeout_duration,
        }
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();

        match timeout(self.timeout_duration, TcpStream::connect(self.target)).await {
            Ok(Ok(_stream)) => {
                let duration = start.elapsed();
                debug!(target = %self.target, duration_ms = duration.as_millis(), "TCP check successful");
                HealthCheckResult::healthy(duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                debug!(target = %self.target, error = %e, "TCP check failed");
                HealthCheckResult::unhealthy(
                    duration,
                    format!("tcp connect to {} failed: {}", self.target, e),
                )
            }
            Err(_) => {
                let duration = start.elapsed();
                debug!(target = %self.target, "TCP check timed out");
                let mut result = HealthCheckResult::timeout(duration);
                result.message = Some(format!(
                    "tcp connect to {} timed out after {}s",
                    self.target,
                    self.timeout_duration.as_secs()
                ));
                result
            }
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

/// HTTP health checker
///
/// Any status in `200..=399` counts as healthy.
pub struct HttpChecker {
    url: String,
    timeout_duration: Duration,
    client: reqwest::Client,
}

impl HttpChecker {
    /// Create a new HTTP health checker
    pub fn new(
        url: String,
        headers: &BTreeMap<String, String>,
        timeout_duration: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    default_headers.insert(name, value);
                }
                _ => debug!(header = %name, "Skipping invalid probe header"),
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            url,
            timeout_duration,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();

        match timeout(self.timeout_duration, self.client.get(&self.url).send()).await {
            Ok(Ok(response)) => {
                let duration = start.elapsed();
                let status_code = response.status().as_u16();

                let mut result = if (200..=399).contains(&status_code) {
                    debug!(url = %self.url, status = status_code, duration_ms = duration.as_millis(),
                           "HTTP check successful");
                    HealthCheckResult::healthy(duration)
                } else {
                    debug!(url = %self.url, status = status_code, "HTTP check failed: unexpected status code");
                    HealthCheckResult::unhealthy(
                        duration,
                        format!("GET {} returned status {}", self.url, status_code),
                    )
                };
                result.response_code = Some(status_code);
                result
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                debug!(url = %self.url, error = %e, "HTTP check failed");
                HealthCheckResult::error(duration, format!("GET {} failed: {}", self.url, e))
            }
            Err(_) => {
                let duration = start.elapsed();
                debug!(url = %self.url, "HTTP check timed out");
                let mut result = HealthCheckResult::timeout(duration);
                result.message = Some(format!(
                    "GET {} timed out after {}s",
                    self.url,
                    self.timeout_duration.as_secs()
                ));
                result
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthStatus, HttpEndpoint, TcpEndpoint};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one connection per entry in `statuses` with that status code.
    async fn serve_http(statuses: Vec<u16>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for status in statuses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_checker_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let checker = TcpChecker::new(addr, Duration::from_secs(1));
        let result = checker.check().await;
        assert!(result.is_healthy());
    }

    #[tokio::test]
    async fn test_tcp_checker_refused() {
        // Bind then drop to get a port nothing listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let checker = TcpChecker::new(addr, Duration::from_millis(500));
        let result = checker.check().await;
        assert!(!result.is_healthy());
        assert!(result.message.unwrap().contains("tcp connect"));
    }

    #[tokio::test]
    async fn test_http_checker_accepts_redirect_range() {
        let addr = serve_http(vec![200, 302]).await;
        let url = format!("http://{}/healthz", addr);
        let checker = HttpChecker::new(url, &BTreeMap::new(), Duration::from_secs(1)).unwrap();

        let first = checker.check().await;
        assert!(first.is_healthy());
        assert_eq!(first.response_code, Some(200));

        let second = checker.check().await;
        assert!(second.is_healthy());
        assert_eq!(second.response_code, Some(302));
    }

    #[tokio::test]
    async fn test_http_checker_rejects_server_error() {
        let addr = serve_http(vec![503]).await;
        let url = format!("http://{}/healthz", addr);
        let checker = HttpChecker::new(url, &BTreeMap::new(), Duration::from_secs(1)).unwrap();

        let result = checker.check().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.response_code, Some(503));
        assert!(result.message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_for_endpoint_builds_matching_checker() {
        let tcp = Endpoint::Tcp(TcpEndpoint {
            ip: "10.0.0.5".to_string(),
            port: 6379,
        });
        let checker = for_endpoint(&tcp, Duration::from_secs(1)).unwrap();
        assert_eq!(checker.name(), "tcp");

        let http = Endpoint::Http(HttpEndpoint {
            ip: "10.0.0.5".to_string(),
            port: 8080,
            scheme: "http".to_string(),
            path: "/healthz".to_string(),
            headers: BTreeMap::from([("X-Probe".to_string(), "health".to_string())]),
        });
        let checker = for_endpoint(&http, Duration::from_secs(1)).unwrap();
        assert_eq!(checker.name(), "http");
    }

    #[test]
    fn test_for_endpoint_rejects_unparseable_target() {
        let tcp = Endpoint::Tcp(TcpEndpoint {
            ip: "not-an-ip".to_string(),
            port: 80,
        });
        assert!(matches!(
            for_endpoint(&tcp, Duration::from_secs(1)),
            Err(ValidationError::Checker(_))
        ));
    }
}
