use anyhow::Result;
use chrono::DateTime;
use chrono_tz::Tz;
use reqwest::StatusCode;
use serde_json::{json, Value};
use shared::models::{CalendarEntry, ChangeType, EventChanges, EventConfig};
use shared::timefmt::pretty_time_range;

const GREEN: &str = "65280";
const RED: &str = "16711680";
const SCHEDULE_EMBED_COLOR: u32 = 1_127_128;

/// Posts one composed update to every configured webhook URL.
pub struct DiscordNotifier {
    http: reqwest::Client,
    webhook_urls: Vec<String>,
    username: String,
    avatar_url: String,
    schedule_url: String,
}

impl DiscordNotifier {
    pub fn new(
        webhook_urls: Vec<String>,
        username: impl Into<String>,
        avatar_url: impl Into<String>,
        schedule_url: impl Into<String>,
    ) -> Result<Self> {
        Ok(DiscordNotifier {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            webhook_urls,
            username: username.into(),
            avatar_url: avatar_url.into(),
            schedule_url: schedule_url.into(),
        })
    }

    /// One webhook payload covering every config's changes and upcoming
    /// schedule: an author embed, a colored embed per non-empty change
    /// list, then a schedule embed per config.
    pub fn build_payload(
        &self,
        changes: &[EventChanges],
        configs: &[EventConfig],
        snapshots: &[Vec<CalendarEntry>],
        now: &DateTime<Tz>,
    ) -> Value {
        let mut embeds = vec![json!({
            "author": {
                "name": format!("{} has an update!", self.username),
                "icon_url": self.avatar_url,
            },
        })];
        embeds.extend(changes.iter().flat_map(|ch| change_embeds(ch, now)));
        embeds.extend(
            configs
                .iter()
                .zip(snapshots)
                .map(|(config, entries)| self.schedule_embed(config, entries, now)),
        );

        json!({
            "username": self.username,
            "avatar_url": self.avatar_url,
            "embeds": embeds,
        })
    }

    fn schedule_embed(
        &self,
        config: &EventConfig,
        entries: &[CalendarEntry],
        now: &DateTime<Tz>,
    ) -> Value {
        let sessions: String = entries
            .iter()
            .map(|e| format!("{}\n", pretty_time_range(&e.start, &e.end)))
            .collect();
        json!({
            "fields": [
                {
                    "name": format!(
                        "{} sessions at {} in the next {} days",
                        config.event_name, config.facility_name, config.lookahead_days
                    ),
                    "value": sessions,
                    "color": SCHEDULE_EMBED_COLOR,
                },
                {
                    "name": "",
                    "value": format!(
                        "Check the [facility schedule]({}?facilityId={})",
                        self.schedule_url, config.facility_id
                    ),
                },
            ],
            "timestamp": now.to_rfc3339(),
        })
    }

    /// Deliver the payload to each webhook, collecting failures instead of
    /// stopping at the first one. Discord acknowledges webhook posts with
    /// 204 No Content.
    pub async fn send(&self, payload: &Value) -> Vec<super::DeliveryError> {
        let mut errors = Vec::new();
        for url in &self.webhook_urls {
            match self.http.post(url).json(payload).send().await {
                Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                    tracing::debug!("Delivered Discord update to {}", url);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    errors.push(super::DeliveryError {
                        message: format!(
                            "could not send Discord message (status code {}, webhook url {})",
                            status.as_u16(),
                            url
                        ),
                        error: body,
                    });
                }
                Err(e) => errors.push(super::DeliveryError {
                    message: format!("could not send Discord message (webhook url {})", url),
                    error: e.to_string(),
                }),
            }
        }
        errors
    }
}

fn change_embeds(changes: &EventChanges, now: &DateTime<Tz>) -> Vec<Value> {
    ChangeType::ALL
        .iter()
        .filter_map(|&kind| {
            let ranges = changes.get(kind);
            if ranges.is_empty() {
                return None;
            }
            let sessions: String = ranges
                .iter()
                .map(|r| format!("{}\n", pretty_time_range(&r.start, &r.end)))
                .collect();
            Some(json!({
                "fields": [{
                    "name": format!(
                        "{} {} Sessions at {}",
                        kind, changes.config.event_name, changes.config.facility_name
                    ),
                    "value": sessions,
                }],
                "color": match kind {
                    ChangeType::New => GREEN,
                    ChangeType::Cancelled => RED,
                },
                "timestamp": now.to_rfc3339(),
            }))
        })
        .collect()
}
