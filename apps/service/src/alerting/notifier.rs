use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Delivery capability for alert emails
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, target: &str, subject: &str, text: &str, html: &str) -> Result<()>;
}

/// Logs alerts instead of delivering them, for setups without a mail relay
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, target: &str, subject: &str, text: &str, _html: &str) -> Result<()> {
        info!(to = target, subject, "Alert email (delivery disabled)");
        debug!(to = target, body = text, "Alert email body");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookEmail<'a> {
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

/// Hands alerts to an HTTP mail relay as JSON
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url).with_context(|| format!("invalid webhook url '{}'", url))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, target: &str, subject: &str, text: &str, html: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookEmail { to: target, subject, text, html })
            .send()
            .await
            .map_err(|e| anyhow!("mail relay request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("mail relay rejected alert for {} with status {}", target, status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_http_once;

    #[tokio::test]
    async fn test_webhook_posts_email_json() -> Result<()> {
        let (url, request) = serve_http_once("HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5))?;

        notifier.send("ops@example.com", "Incident started", "text body", "<p>html</p>").await?;

        let request = request.await?;
        assert!(request.starts_with("POST / HTTP/1.1"));
        let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
        let json: serde_json::Value = serde_json::from_str(body)?;
        assert_eq!(json["to"], "ops@example.com");
        assert_eq!(json["subject"], "Incident started");
        assert_eq!(json["html"], "<p>html</p>");
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_rejection_is_an_error() -> Result<()> {
        let (url, _request) = serve_http_once("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5))?;

        assert!(notifier.send("ops@example.com", "s", "t", "h").await.is_err());
        Ok(())
    }

    #[test]
    fn test_webhook_requires_valid_url() {
        assert!(WebhookNotifier::new("not a url", Duration::from_secs(1)).is_err());
    }
}
