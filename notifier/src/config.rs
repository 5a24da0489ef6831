use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use shared::models::{EventConfig, FilterRule};

/// Service configuration, loaded from a TOML file at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// IANA zone used for fetch windows and change comparisons
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Calendar API endpoint queried once per facility window
    pub calendar_url: String,

    /// Facility schedule page linked from notifications
    pub schedule_url: String,

    /// Directory snapshots and subscriber state are stored in
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between passes in serve mode
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Display name the channels post under
    #[serde(default = "default_bot_username")]
    pub bot_username: String,

    /// Avatar shown next to Discord posts
    #[serde(default = "default_bot_avatar_url")]
    pub bot_avatar_url: String,

    /// Optional footer link appended to Telegram messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    /// Tracked event types, one snapshot and diff per entry
    pub events: Vec<EventConfig>,
}

fn default_timezone() -> String {
    "US/Eastern".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_poll_interval() -> u64 {
    300 // 5 minutes
}

fn default_bot_username() -> String {
    "facility-notifier".to_string()
}

fn default_bot_avatar_url() -> String {
    "https://example.com/avatar.png".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        if config.events.is_empty() {
            anyhow::bail!("Config lists no events to track");
        }
        Ok(config)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown timezone: {}", self.timezone))
    }

    pub fn example() -> Self {
        Config {
            timezone: default_timezone(),
            calendar_url: "https://recreation.example.edu/Facility/GetScheduleCustomAppointments"
                .to_string(),
            schedule_url: "https://recreation.example.edu/Facility/GetSchedule".to_string(),
            data_dir: default_data_dir(),
            poll_interval_secs: default_poll_interval(),
            bot_username: default_bot_username(),
            bot_avatar_url: default_bot_avatar_url(),
            source_url: None,
            events: vec![
                EventConfig {
                    facility_id: "9a7f2c64-1d3e-4c52-8b7a-5e2f0c9d1b42".to_string(),
                    facility_name: "Main Arena".to_string(),
                    lookahead_days: 7,
                    event_name: "Open Rec Skate".to_string(),
                    filter: FilterRule::Contains {
                        needle: "open rec".to_string(),
                    },
                },
                EventConfig {
                    facility_id: "9a7f2c64-1d3e-4c52-8b7a-5e2f0c9d1b42".to_string(),
                    facility_name: "Main Arena".to_string(),
                    lookahead_days: 7,
                    event_name: "Figure Skating Club".to_string(),
                    filter: FilterRule::All {
                        rules: vec![
                            FilterRule::Contains {
                                needle: "figure skating".to_string(),
                            },
                            FilterRule::Contains {
                                needle: "club".to_string(),
                            },
                            FilterRule::Not {
                                rule: Box::new(FilterRule::Contains {
                                    needle: "hold".to_string(),
                                }),
                            },
                        ],
                    },
                },
            ],
        }
    }
}

/// Channel secrets, read from the environment once at startup and passed
/// down explicitly. An absent variable disables that channel.
#[derive(Debug, Clone, Default)]
pub struct Channels {
    pub discord_webhook_urls: Vec<String>,
    pub telegram_bot_token: Option<String>,
}

impl Channels {
    pub fn from_env() -> Self {
        let discord_webhook_urls = std::env::var("DISCORD_WEBHOOK_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        Channels {
            discord_webhook_urls,
            telegram_bot_token,
        }
    }
}
