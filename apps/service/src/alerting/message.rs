use chrono::{DateTime, Utc};

use crate::database::models::{AlertType, Incident};

/// Rendered alert email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl AlertMessage {
    pub fn for_incident(
        alert_type: AlertType,
        url: &str,
        incident: &Incident,
        dashboard_url: Option<&str>,
    ) -> Self {
        let started = format_time(incident.started_at);

        let (subject, title, message) = match alert_type {
            AlertType::IncidentStarted => (
                format!("Incident started: {}", url),
                "Endpoint is down",
                format!("{} is not reachable from a majority of regions since {}.", url, started),
            ),
            AlertType::IncidentResolved => {
                let ended_at = incident.ended_at.unwrap_or_else(Utc::now);
                (
                    format!("Incident resolved: {}", url),
                    "Endpoint has recovered",
                    format!(
                        "{} is reachable again. It was down from {} to {} ({}).",
                        url,
                        started,
                        format_time(ended_at),
                        format_duration(ended_at - incident.started_at)
                    ),
                )
            }
        };

        let mut text = format!("{}\n\nIncident: {}", message, incident.id);
        if let Some(dashboard) = dashboard_url {
            text.push_str(&format!("\nDashboard: {}", dashboard));
        }

        let html = render_html(title, &message, url, dashboard_url);
        Self { subject, text, html }
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Human readable duration, e.g. `1h 5m 3s`
fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn render_html(title: &str, message: &str, url: &str, dashboard_url: Option<&str>) -> String {
    let url = escape_html(url);
    let dashboard = dashboard_url
        .map(|link| {
            let link = escape_html(link);
            format!(r#"<p style="margin-top: 20px;"><a href="{link}" style="color: #007bff;">Open dashboard</a></p>"#)
        })
        .unwrap_or_default();

    format!(
        r#"<div style="font-family: sans-serif; max-width: 600px; margin: 0 auto; padding: 20px; border: 1px solid #eee; border-radius: 10px;">
  <h2 style="color: #333;">{title}</h2>
  <p style="font-size: 16px; color: #555;">{message}</p>
  <div style="margin-top: 30px; padding: 15px; background-color: #f9f9f9; border-radius: 5px;">
    <p style="margin: 0; font-weight: bold;">Target:</p>
    <a href="{url}" style="color: #007bff; text-decoration: none;">{url}</a>
  </div>
  {dashboard}
  <p style="margin-top: 30px; font-size: 12px; color: #999;">This is an automated alert from tickwatch.</p>
</div>"#,
        title = escape_html(title),
        message = escape_html(message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::IncidentStatus;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn incident(ended: Option<DateTime<Utc>>) -> Incident {
        Incident {
            id: Uuid::new_v4(),
            endpoint_id: "e1".into(),
            status: if ended.is_some() { IncidentStatus::Closed } else { IncidentStatus::Open },
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            ended_at: ended,
        }
    }

    #[test]
    fn test_started_message() {
        let message = AlertMessage::for_incident(
            AlertType::IncidentStarted,
            "https://example.com",
            &incident(None),
            None,
        );
        assert_eq!(message.subject, "Incident started: https://example.com");
        assert!(message.text.contains("since 2026-03-01 12:00:00 UTC"));
        assert!(message.html.contains("Endpoint is down"));
        assert!(!message.html.contains("Open dashboard"));
    }

    #[test]
    fn test_resolved_message_reports_duration() {
        let ended = Utc.with_ymd_and_hms(2026, 3, 1, 13, 2, 5).unwrap();
        let message = AlertMessage::for_incident(
            AlertType::IncidentResolved,
            "https://example.com",
            &incident(Some(ended)),
            Some("https://status.example.com"),
        );
        assert_eq!(message.subject, "Incident resolved: https://example.com");
        assert!(message.text.contains("(1h 2m 5s)"));
        assert!(message.text.contains("Dashboard: https://status.example.com"));
        assert!(message.html.contains("Open dashboard"));
    }

    #[test]
    fn test_html_escapes_target() {
        let message = AlertMessage::for_incident(
            AlertType::IncidentStarted,
            "https://example.com/?a=<script>",
            &incident(None),
            None,
        );
        assert!(!message.html.contains("<script>"));
        assert!(message.html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(format_duration(chrono::Duration::seconds(-5)), "0s");
    }
}
