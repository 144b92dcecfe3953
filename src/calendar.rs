//! Calendar provider synchronization.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::CalendarConfig;
use crate::entities::CalendarEventRecord;
use crate::error::CalendarError;

/// Remote calendar that mirrors locally created events.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Create the event remotely and return the provider's id for it.
    async fn create_event(&self, event: &CalendarEventRecord) -> Result<String, CalendarError>;

    async fn update_event(
        &self,
        provider_event_id: &str,
        event: &CalendarEventRecord,
    ) -> Result<(), CalendarError>;
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    id: String,
}

/// Google Calendar v3 client. The bearer token is supplied by the operator.
pub struct GoogleCalendarClient {
    api_url: String,
    calendar_id: String,
    token: SecretString,
    client: reqwest::Client,
}

impl GoogleCalendarClient {
    pub fn new(config: &CalendarConfig, timeout: std::time::Duration) -> Result<Self, CalendarError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            calendar_id: config.calendar_id.clone(),
            token: config.token.clone(),
            client,
        })
    }

    fn events_url(&self) -> String {
        format!("{}/calendars/{}/events", self.api_url, self.calendar_id)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CalendarError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CalendarError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Provider wire body. All-day events use `date`, timed events `dateTime`.
fn event_body(event: &CalendarEventRecord) -> serde_json::Value {
    let (start, end) = if event.all_day {
        (
            json!({ "date": event.start_at.date_naive().to_string() }),
            json!({ "date": event.end_at.date_naive().to_string() }),
        )
    } else {
        (
            json!({ "dateTime": event.start_at.to_rfc3339(), "timeZone": "UTC" }),
            json!({ "dateTime": event.end_at.to_rfc3339(), "timeZone": "UTC" }),
        )
    };

    let mut body = json!({
        "summary": event.title,
        "start": start,
        "end": end,
    });
    if let Some(location) = event.location.as_ref().or(event.meeting_link.as_ref()) {
        body["location"] = json!(location);
    }
    if let Some(link) = &event.meeting_link {
        body["description"] = json!(format!("Enlace: {link}"));
    }
    body
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn create_event(&self, event: &CalendarEventRecord) -> Result<String, CalendarError> {
        let resp = self
            .client
            .post(self.events_url())
            .bearer_auth(self.token.expose_secret())
            .json(&event_body(event))
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        let created: EventResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| CalendarError::InvalidResponse(e.to_string()))?;

        tracing::info!(event_id = %event.id, provider_id = %created.id, "Calendar event created");
        Ok(created.id)
    }

    async fn update_event(
        &self,
        provider_event_id: &str,
        event: &CalendarEventRecord,
    ) -> Result<(), CalendarError> {
        let resp = self
            .client
            .put(format!("{}/{provider_event_id}", self.events_url()))
            .bearer_auth(self.token.expose_secret())
            .json(&event_body(event))
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        Self::check(resp).await?;
        tracing::debug!(provider_id = provider_event_id, "Calendar event updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn record(all_day: bool) -> CalendarEventRecord {
        let now = Utc::now();
        CalendarEventRecord {
            id: Uuid::new_v4(),
            source_key: "k".into(),
            owner_id: "owner".into(),
            title: "Nos vemos".into(),
            start_at: Utc.with_ymd_and_hms(2026, 6, 3, 15, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2026, 6, 3, 16, 0, 0).unwrap(),
            all_day,
            location: None,
            is_virtual: true,
            meeting_link: Some("https://meet.google.com/abc".into()),
            provider_event_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn timed_event_body() {
        let body = event_body(&record(false));
        assert_eq!(body["summary"], "Nos vemos");
        assert_eq!(body["start"]["dateTime"], "2026-06-03T15:00:00+00:00");
        assert_eq!(body["location"], "https://meet.google.com/abc");
    }

    #[test]
    fn all_day_event_body() {
        let body = event_body(&record(true));
        assert_eq!(body["start"]["date"], "2026-06-03");
        assert!(body["start"].get("dateTime").is_none());
    }

    #[test]
    fn events_url_includes_calendar() {
        let config = CalendarConfig {
            api_url: "https://example.test/v3/".into(),
            calendar_id: "primary".into(),
            token: SecretString::from("t"),
        };
        let client = GoogleCalendarClient::new(&config, std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(client.events_url(), "https://example.test/v3/calendars/primary/events");
    }
}
