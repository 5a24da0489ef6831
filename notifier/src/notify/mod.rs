mod discord;
mod telegram;

use std::collections::BTreeSet;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;
use shared::models::{CalendarEntry, EventChanges, EventConfig};

pub use discord::DiscordNotifier;
pub use telegram::TelegramNotifier;

use crate::store::KvStore;

/// A failed delivery to one endpoint or subscriber. Failures are collected
/// so the remaining endpoints still get attempted; the pipeline decides
/// what a non-empty collection means for the run.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryError {
    pub message: String,
    pub error: String,
}

/// The set of configured notification channels. An unconfigured channel is
/// simply absent and delivering to it is a successful no-op.
pub struct Fanout {
    pub discord: Option<DiscordNotifier>,
    pub telegram: Option<TelegramNotifier>,
}

impl Fanout {
    /// Render and deliver one batched update covering every config's
    /// changes and upcoming schedule to every configured channel.
    pub async fn dispatch<S: KvStore>(
        &self,
        store: &S,
        subscribers: &BTreeSet<i64>,
        changes: &[EventChanges],
        configs: &[EventConfig],
        snapshots: &[Vec<CalendarEntry>],
        now: &DateTime<Tz>,
    ) -> Vec<DeliveryError> {
        let mut errors = Vec::new();

        if let Some(discord) = &self.discord {
            let payload = discord.build_payload(changes, configs, snapshots, now);
            errors.extend(discord.send(&payload).await);
        }

        if let Some(telegram) = &self.telegram {
            let message = telegram.compose_message(changes, configs, snapshots);
            errors.extend(telegram.send_updates(store, subscribers, &message).await);
        }

        errors
    }
}
