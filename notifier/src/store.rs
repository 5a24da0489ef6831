use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use shared::models::{CalendarEntry, EventConfig};

/// String-keyed JSON store the pipeline keeps snapshots and Telegram
/// subscriber state in. Writes are last-write-wins; no key spans a
/// transaction with another.
#[allow(async_fn_in_trait)]
pub trait KvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> Result<()>;
}

/// One JSON file per key under a data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_for_filename(key)))
    }
}

impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

fn sanitize_for_filename(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' | ' ' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Storage key for one event configuration's snapshot.
pub fn snapshot_key(config: &EventConfig) -> String {
    format!("cal_entries_{}_{}", config.facility_id, config.event_name)
}

/// Load the last-seen snapshot for a config; never stored means an empty
/// tracked set.
pub async fn load_snapshot<S: KvStore>(
    store: &S,
    config: &EventConfig,
) -> Result<Vec<CalendarEntry>> {
    match store.get(&snapshot_key(config)).await? {
        Some(value) => serde_json::from_value(value).with_context(|| {
            format!("Stored snapshot for {} is malformed", config.event_name)
        }),
        None => Ok(Vec::new()),
    }
}

pub async fn store_snapshot<S: KvStore>(
    store: &S,
    config: &EventConfig,
    entries: &[CalendarEntry],
) -> Result<()> {
    store
        .put(&snapshot_key(config), serde_json::to_value(entries)?)
        .await
}
