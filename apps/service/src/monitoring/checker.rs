use anyhow::{Result, anyhow};
use std::time::Duration;

/// Checker trait for the network probe
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    /// Perform the check and return the HTTP status code.
    /// `Err` means the target could not be reached at all.
    async fn check(&self, target: &str) -> Result<u16>;
}

/// HTTP/HTTPS checker
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tickwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    async fn check(&self, target: &str) -> Result<u16> {
        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("HTTP request timed out: {}", e)
                } else {
                    anyhow!("HTTP request failed: {}", e)
                }
            })?;

        // Any answer counts as reachable, whatever the status code
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_http_once;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_server_error_still_counts_as_reachable() {
        let (url, request) = serve_http_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let checker = HttpChecker::new(Duration::from_secs(5)).unwrap();

        assert_eq!(checker.check(&url).await.unwrap(), 503);
        assert!(request.await.unwrap().starts_with("GET / HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checker = HttpChecker::new(Duration::from_secs(5)).unwrap();
        assert!(checker.check(&format!("http://{}/", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and never answer
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let checker = HttpChecker::new(Duration::from_millis(200)).unwrap();
        let err = checker.check(&format!("http://{}/", addr)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
