use std::collections::BTreeSet;

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use shared::models::{CalendarEntry, EventChanges, ReqParam};
use shared::timefmt::{end_of_day, start_of_day};
use thiserror::Error;

use crate::config::{Channels, Config};
use crate::diff::detect_changes;
use crate::fetcher::{CalendarClient, FetchError};
use crate::notify::{DeliveryError, DiscordNotifier, Fanout, TelegramNotifier};
use crate::store::{load_snapshot, store_snapshot, KvStore};

/// Result of one successful pass.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub message: String,
    pub has_changes: bool,
}

/// Why a pass failed. Fetch errors abort before any notification or
/// persistence; delivery errors abort before persistence so the next run
/// recomputes and retries the same diff.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not get calendar data: {0}")]
    Fetch(#[from] FetchError),
    #[error("{} notification deliveries failed", .0.len())]
    Delivery(Vec<DeliveryError>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One fetch → filter → diff → notify → persist pass over the whole event
/// registry. Runs are assumed non-overlapping; nothing here locks the
/// store.
pub struct Pipeline<S> {
    config: Config,
    tz: Tz,
    calendar: CalendarClient,
    store: S,
    fanout: Fanout,
}

impl<S: KvStore> Pipeline<S> {
    pub fn new(config: Config, channels: Channels, store: S) -> Result<Self> {
        let tz = config.tz()?;
        let calendar = CalendarClient::new(&config.calendar_url)?;

        let discord = if channels.discord_webhook_urls.is_empty() {
            None
        } else {
            Some(DiscordNotifier::new(
                channels.discord_webhook_urls,
                &config.bot_username,
                &config.bot_avatar_url,
                &config.schedule_url,
            )?)
        };
        let telegram = match channels.telegram_bot_token {
            Some(token) => Some(TelegramNotifier::new(
                token,
                &config.schedule_url,
                config.source_url.clone(),
            )?),
            None => None,
        };

        Ok(Pipeline {
            config,
            tz,
            calendar,
            store,
            fanout: Fanout { discord, telegram },
        })
    }

    pub async fn run_once(&self) -> Result<RunOutcome, RunError> {
        // One instant for the whole pass; every comparison below uses it.
        let now = Utc::now().with_timezone(&self.tz);
        let now_utc = now.with_timezone(&Utc);

        tracing::info!(
            "Starting pass over {} event configs",
            self.config.events.len()
        );

        // Inbound Telegram commands first, so new subscribers catch
        // whatever this pass finds.
        let subscribers = match &self.fanout.telegram {
            Some(telegram) => telegram.refresh_subscribers(&self.store).await?,
            None => BTreeSet::new(),
        };

        let start = start_of_day(&now);
        let req_params: Vec<ReqParam> = self
            .config
            .events
            .iter()
            .map(|c| ReqParam {
                facility_id: c.facility_id.clone(),
                start: start.clone(),
                end: end_of_day(&(now + chrono::Duration::days(i64::from(c.lookahead_days)))),
            })
            .collect();

        // Calendar fetches and snapshot reads are independent; run them
        // concurrently and fan in before diffing.
        let (calendar_data, stored) =
            tokio::join!(self.calendar.fetch_all(&req_params), self.load_snapshots());
        let calendar_data = calendar_data?;
        let stored = stored?;

        let mut current: Vec<Vec<CalendarEntry>> = Vec::with_capacity(self.config.events.len());
        for (config, param) in self.config.events.iter().zip(&req_params) {
            let raw = calendar_data.get(param).ok_or_else(|| {
                anyhow::anyhow!("missing fetch result for facility {}", param.facility_id)
            })?;
            current.push(
                raw.iter()
                    .filter(|e| config.filter.matches(e))
                    .cloned()
                    .collect(),
            );
        }

        let changes: Vec<EventChanges> = self
            .config
            .events
            .iter()
            .zip(stored.iter().zip(&current))
            .map(|(config, (prev, cur))| detect_changes(config, prev, cur, now_utc, self.tz))
            .collect();

        let has_changes = changes.iter().any(|ch| !ch.is_empty());
        if has_changes {
            let errors = self
                .fanout
                .dispatch(
                    &self.store,
                    &subscribers,
                    &changes,
                    &self.config.events,
                    &current,
                    &now,
                )
                .await;
            if !errors.is_empty() {
                // Leave the old snapshots in place: the next pass will
                // recompute this diff and retry the notification.
                return Err(RunError::Delivery(errors));
            }
        }

        for (config, (prev, cur)) in self.config.events.iter().zip(stored.iter().zip(&current)) {
            if prev != cur {
                store_snapshot(&self.store, config, cur).await?;
            }
        }

        tracing::info!("Pass complete (changes: {})", has_changes);
        Ok(RunOutcome {
            message: "Success".to_string(),
            has_changes,
        })
    }

    async fn load_snapshots(&self) -> Result<Vec<Vec<CalendarEntry>>> {
        futures::future::try_join_all(
            self.config
                .events
                .iter()
                .map(|c| load_snapshot(&self.store, c)),
        )
        .await
    }
}
