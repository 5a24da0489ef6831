use std::collections::BTreeSet;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use shared::models::{CalendarEntry, ChangeType, EventChanges, EventConfig};
use shared::timefmt::pretty_time_range;

use crate::store::KvStore;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Store keys for inbound-command state, shared across runs.
pub const LAST_UPDATE_ID_KEY: &str = "telegram_last_update_id";
pub const SUBSCRIBERS_KEY: &str = "telegram_update_subscribers";

const WELCOME_MESSAGE: &str = "Hi there! I'm a bot that sends updates about facility schedules. \
To subscribe to updates, please send me /subscribe. To unsubscribe, please send me /unsubscribe. \
Send me /help to see this message again. I reply periodically instead of on-demand, so it might \
take a few minutes (depending on my deployment setting) for me to respond.";

#[derive(Debug, thiserror::Error)]
enum SendError {
    /// The chat rejected the message: the bot was blocked or removed.
    #[error("chat rejected the message (status code {0})")]
    Rejected(u16),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    my_chat_member: Option<ChatMemberUpdated>,
}

impl Update {
    fn effective_chat(&self) -> Option<i64> {
        self.message
            .as_ref()
            .map(|m| m.chat.id)
            .or_else(|| self.my_chat_member.as_ref().map(|m| m.chat.id))
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ChatMemberUpdated {
    chat: Chat,
}

/// Telegram Bot API client: polls inbound commands to maintain the
/// subscriber set and fans the composed update out to every subscriber.
pub struct TelegramNotifier {
    http: reqwest::Client,
    token: String,
    base_url: String,
    schedule_url: String,
    source_url: Option<String>,
}

impl TelegramNotifier {
    pub fn new(
        token: impl Into<String>,
        schedule_url: impl Into<String>,
        source_url: Option<String>,
    ) -> Result<Self> {
        Self::with_base_url(token, TELEGRAM_API_BASE, schedule_url, source_url)
    }

    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
        schedule_url: impl Into<String>,
        source_url: Option<String>,
    ) -> Result<Self> {
        Ok(TelegramNotifier {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            token: token.into(),
            base_url: base_url.into(),
            schedule_url: schedule_url.into(),
            source_url,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Process commands received since the last run and return the current
    /// subscriber set. Both the high-water update id and the subscriber set
    /// are persisted before returning.
    pub async fn refresh_subscribers<S: KvStore>(&self, store: &S) -> Result<BTreeSet<i64>> {
        let mut last_update_id = store
            .get(LAST_UPDATE_ID_KEY)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(-1);
        let mut subscribers: BTreeSet<i64> = match store.get(SUBSCRIBERS_KEY).await? {
            Some(value) => {
                serde_json::from_value(value).context("Stored subscriber set is malformed")?
            }
            None => BTreeSet::new(),
        };

        let updates = self.get_updates(last_update_id + 1).await?;
        tracing::debug!("Processing {} Telegram updates", updates.len());

        for update in updates {
            last_update_id = last_update_id.max(update.update_id);

            let Some(chat_id) = update.effective_chat() else {
                tracing::warn!("Update {} has no effective chat, skipping", update.update_id);
                continue;
            };

            let reply = if let Some(message) = &update.message {
                let Some(text) = &message.text else {
                    // Non-text messages are service noise.
                    continue;
                };
                let text = text.to_lowercase();
                let reply_to = Some(message.message_id);
                if text.contains("/unsubscribe") {
                    subscribers.remove(&chat_id);
                    ("This chat has been unsubscribed from updates.", reply_to)
                } else if text.contains("/subscribe") {
                    subscribers.insert(chat_id);
                    ("This chat has been subscribed to updates!", reply_to)
                } else if text.contains("/start") || text.contains("/help") {
                    (WELCOME_MESSAGE, reply_to)
                } else {
                    (
                        "I don't understand this command. Please use /help to see a list of available commands.",
                        reply_to,
                    )
                }
            } else if update.my_chat_member.is_some() {
                // The bot was added to (or its status changed in) a chat.
                (WELCOME_MESSAGE, None)
            } else {
                tracing::warn!("Unknown update type for update {}", update.update_id);
                continue;
            };

            match self.send_message(chat_id, reply.0, reply.1, false).await {
                Ok(()) => {}
                Err(SendError::Rejected(status)) => {
                    tracing::warn!(
                        "Chat {} rejected the reply (status code {}), removing it from subscribers",
                        chat_id,
                        status
                    );
                    subscribers.remove(&chat_id);
                }
                Err(SendError::Other(e)) => anyhow::bail!("could not reply to chat {chat_id}: {e}"),
            }
        }

        store.put(LAST_UPDATE_ID_KEY, json!(last_update_id)).await?;
        store
            .put(SUBSCRIBERS_KEY, serde_json::to_value(&subscribers)?)
            .await?;

        Ok(subscribers)
    }

    /// One Markdown message covering every config's changes and upcoming
    /// schedule, shared by all subscribers.
    pub fn compose_message(
        &self,
        changes: &[EventChanges],
        configs: &[EventConfig],
        snapshots: &[Vec<CalendarEntry>],
    ) -> String {
        let mut blocks: Vec<String> = changes
            .iter()
            .map(format_changes)
            .filter(|b| !b.is_empty())
            .collect();
        blocks.extend(
            configs
                .iter()
                .zip(snapshots)
                .map(|(config, entries)| self.format_schedule(config, entries)),
        );
        if let Some(url) = &self.source_url {
            blocks.push(format!("------------\n[Bot source code]({url})"));
        }
        blocks.join("\n\n")
    }

    fn format_schedule(&self, config: &EventConfig, entries: &[CalendarEntry]) -> String {
        let mut message = format!(
            "*{} sessions at {} in the next {} days*",
            config.event_name, config.facility_name, config.lookahead_days
        );
        for e in entries {
            message.push('\n');
            message.push_str(&pretty_time_range(&e.start, &e.end));
        }
        message.push_str(&format!(
            "\n[facility schedule]({}?facilityId={})",
            self.schedule_url, config.facility_id
        ));
        message
    }

    /// Send the composed update to every subscriber. A chat that rejects
    /// the message (blocked/removed bot) is dropped from the persisted set
    /// rather than reported; other failures are collected per chat.
    pub async fn send_updates<S: KvStore>(
        &self,
        store: &S,
        subscribers: &BTreeSet<i64>,
        message: &str,
    ) -> Vec<super::DeliveryError> {
        let mut errors = Vec::new();
        let mut remaining = subscribers.clone();

        for &chat_id in subscribers {
            match self.send_message(chat_id, message, None, true).await {
                Ok(()) => tracing::debug!("Delivered Telegram update to chat {}", chat_id),
                Err(SendError::Rejected(status)) => {
                    tracing::warn!(
                        "Chat {} rejected the update (status code {}), removing it from subscribers",
                        chat_id,
                        status
                    );
                    remaining.remove(&chat_id);
                }
                Err(SendError::Other(e)) => errors.push(super::DeliveryError {
                    message: format!("could not send Telegram message to chat {chat_id}"),
                    error: e,
                }),
            }
        }

        if remaining.len() != subscribers.len() {
            match serde_json::to_value(&remaining) {
                Ok(value) => {
                    if let Err(e) = store.put(SUBSCRIBERS_KEY, value).await {
                        errors.push(super::DeliveryError {
                            message: "could not persist the Telegram subscriber set".to_string(),
                            error: e.to_string(),
                        });
                    }
                }
                Err(e) => errors.push(super::DeliveryError {
                    message: "could not serialize the Telegram subscriber set".to_string(),
                    error: e.to_string(),
                }),
            }
        }

        errors
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response = self
            .http
            .post(self.method_url("getUpdates"))
            .json(&json!({ "offset": offset }))
            .send()
            .await
            .context("getUpdates request failed")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "getUpdates failed (status code {})",
                response.status().as_u16()
            );
        }
        let api: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .context("getUpdates returned an unparseable body")?;
        if !api.ok {
            anyhow::bail!(
                "getUpdates rejected: {}",
                api.description.unwrap_or_default()
            );
        }
        Ok(api.result.unwrap_or_default())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        markdown: bool,
    ) -> Result<(), SendError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if markdown {
            body["parse_mode"] = json!("Markdown");
            body["disable_web_page_preview"] = json!(true);
        }
        if let Some(message_id) = reply_to {
            body["reply_to_message_id"] = json!(message_id);
        }

        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Other(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::BAD_REQUEST {
            return Err(SendError::Rejected(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Other(format!(
                "sendMessage failed (status code {}): {}",
                status.as_u16(),
                body
            )));
        }
        Ok(())
    }
}

/// One Markdown block per change type, empty when nothing changed.
fn format_changes(changes: &EventChanges) -> String {
    let mut message = String::new();
    for kind in ChangeType::ALL {
        let ranges = changes.get(kind);
        if ranges.is_empty() {
            continue;
        }
        if !message.is_empty() {
            message.push_str("\n\n");
        }
        message.push_str(&format!(
            "*{} {} sessions*",
            kind, changes.config.event_name
        ));
        let emoji = match kind {
            ChangeType::New => "\u{2705}",
            ChangeType::Cancelled => "\u{274c}",
        };
        for range in ranges {
            message.push_str(&format!(
                "\n{} {}",
                emoji,
                pretty_time_range(&range.start, &range.end)
            ));
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use shared::models::{FilterRule, TimeRange};
    use wiremock::matchers::{body_json, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> EventConfig {
        EventConfig {
            facility_id: "f1".to_string(),
            facility_name: "Main Arena".to_string(),
            lookahead_days: 7,
            event_name: "Open Rec Skate".to_string(),
            filter: FilterRule::Contains {
                needle: "open rec".to_string(),
            },
        }
    }

    fn notifier(base_url: &str) -> TelegramNotifier {
        TelegramNotifier::with_base_url(
            "token",
            base_url,
            "https://recreation.example.edu/Facility/GetSchedule",
            Some("https://example.com/source".to_string()),
        )
        .unwrap()
    }

    fn message_update(update_id: i64, chat_id: i64, text: &str) -> serde_json::Value {
        json!({
            "update_id": update_id,
            "message": { "message_id": update_id * 10, "chat": { "id": chat_id }, "text": text },
        })
    }

    #[test]
    fn composes_changes_schedule_and_footer() {
        let notifier = notifier("http://unused");
        let changes = EventChanges {
            config: config(),
            new: vec![TimeRange {
                start: "2024-01-05T12:00:00".to_string(),
                end: "2024-01-05T13:00:00".to_string(),
            }],
            cancelled: vec![TimeRange {
                start: "2024-01-03T12:00:00".to_string(),
                end: "2024-01-03T13:00:00".to_string(),
            }],
        };
        let snapshot = vec![CalendarEntry {
            title: "Open Rec Skate".to_string(),
            start: "2024-01-05T12:00:00".to_string(),
            end: "2024-01-05T13:00:00".to_string(),
            extra: serde_json::Map::new(),
        }];

        let message = notifier.compose_message(
            &[changes],
            &[config()],
            std::slice::from_ref(&snapshot),
        );

        let expected = "*New Open Rec Skate sessions*\n\
            \u{2705} Fri Jan 05 12:00PM - 01:00PM\n\n\
            *Cancelled Open Rec Skate sessions*\n\
            \u{274c} Wed Jan 03 12:00PM - 01:00PM\n\n\
            *Open Rec Skate sessions at Main Arena in the next 7 days*\n\
            Fri Jan 05 12:00PM - 01:00PM\n\
            [facility schedule](https://recreation.example.edu/Facility/GetSchedule?facilityId=f1)\n\n\
            ------------\n\
            [Bot source code](https://example.com/source)";
        assert_eq!(message, expected);
    }

    #[test]
    fn empty_changes_blocks_are_dropped() {
        let notifier = notifier("http://unused");
        let message =
            notifier.compose_message(&[EventChanges::none(config())], &[config()], &[vec![]]);
        assert!(message.starts_with("*Open Rec Skate sessions at Main Arena"));
    }

    #[tokio::test]
    async fn refresh_processes_commands_and_persists_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottoken/getUpdates"))
            .and(body_json(json!({ "offset": 11 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [
                    message_update(11, 200, "/subscribe"),
                    message_update(12, 100, "/unsubscribe"),
                    message_update(13, 300, "/help"),
                    { "update_id": 14, "my_chat_member": { "chat": { "id": 400 } } },
                ],
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bottoken/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(4)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.put(LAST_UPDATE_ID_KEY, json!(10)).await.unwrap();
        store.put(SUBSCRIBERS_KEY, json!([100])).await.unwrap();

        let subscribers = notifier(&server.uri()).refresh_subscribers(&store).await.unwrap();

        assert_eq!(subscribers, BTreeSet::from([200]));
        assert_eq!(
            store.get(LAST_UPDATE_ID_KEY).await.unwrap(),
            Some(json!(14))
        );
        assert_eq!(store.get(SUBSCRIBERS_KEY).await.unwrap(), Some(json!([200])));
    }

    #[tokio::test]
    async fn rejected_reply_removes_the_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottoken/getUpdates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [message_update(1, 100, "/subscribe")],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bottoken/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user",
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let subscribers = notifier(&server.uri()).refresh_subscribers(&store).await.unwrap();

        assert!(subscribers.is_empty());
        assert_eq!(store.get(SUBSCRIBERS_KEY).await.unwrap(), Some(json!([])));
    }

    #[tokio::test]
    async fn blocked_subscriber_is_removed_without_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottoken/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bottoken/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": 200 })))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.put(SUBSCRIBERS_KEY, json!([100, 200])).await.unwrap();

        let subscribers = BTreeSet::from([100, 200]);
        let errors = notifier(&server.uri())
            .send_updates(&store, &subscribers, "update")
            .await;

        assert!(errors.is_empty());
        assert_eq!(store.get(SUBSCRIBERS_KEY).await.unwrap(), Some(json!([100])));
    }

    #[tokio::test]
    async fn send_failure_is_collected_per_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottoken/sendMessage"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let errors = notifier(&server.uri())
            .send_updates(&store, &BTreeSet::from([100]), "update")
            .await;

        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("100"));
        assert!(errors[0].error.contains("500"));
    }
}
