//! # Configuration
//!
//! [Settings] can be built in code, or loaded from a JSON, TOML or YAML file
//! and from environment variables through [figment]. Durations are written in
//! human-friendly form, for example `'250ms'` or `'30s'`.
//!
//! ```yaml
//! merge_watch_min_backoff: '10ms'
//! merge_watch_max_backoff: '1s'
//! merge_watch_timeout: '30s'
//! max_snapshot_bytes: 536870912
//! ```

use duration_str::{deserialize_duration, deserialize_option_duration};
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::{Figment, Metadata, Provider};
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;

/// Settings for a replica.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Initial delay between descriptor checks while a replica waits for an
    /// in-progress merge to resolve.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub merge_watch_min_backoff: Duration,

    /// Upper bound on the delay between descriptor checks.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub merge_watch_max_backoff: Duration,

    /// How long a command may wait for a merge to resolve before failing with
    /// a retryable error. If None, commands wait until the merge resolves.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_option_duration")]
    #[serde(serialize_with = "serialize_option_duration")]
    pub merge_watch_timeout: Option<Duration>,

    /// Largest merge snapshot, in buffered bytes, a replica will build. A
    /// range holding more fails the snapshot request as a whole. If None,
    /// snapshots are unbounded.
    pub max_snapshot_bytes: Option<usize>,
}

impl Settings {
    /// Loads Settings from a file. The format is chosen by extension: `json`,
    /// `toml`, `yaml` or `yml`. Fields missing from the file keep their
    /// defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, StoreError> {
        let path = path.as_ref();
        let Some(ext) = path.extension() else {
            return Err(StoreError::UnknownConfigurationFormat(path.into()));
        };

        let mut builder = Figment::from(Settings::default());
        match ext.to_str().unwrap_or_default() {
            "json" => builder = builder.merge(Json::file(path)),
            "toml" => builder = builder.merge(Toml::file(path)),
            "yaml" | "yml" => builder = builder.merge(Yaml::file(path)),
            _ => return Err(StoreError::UnknownConfigurationFormat(path.into())),
        }
        builder
            .extract()
            .map_err(|e| StoreError::InvalidConfigurationFormat(Box::new(e)))
    }

    /// Loads Settings from environment variables starting with `prefix`. For
    /// a prefix of `RANGESTORE_`, `RANGESTORE_MERGE_WATCH_TIMEOUT` sets
    /// `merge_watch_timeout`.
    pub fn from_env(prefix: &str) -> Result<Settings, StoreError> {
        Figment::from(Settings::default())
            .merge(Env::prefixed(prefix))
            .extract()
            .map_err(|e| StoreError::InvalidConfigurationFormat(Box::new(e)))
    }

    /// Loads Settings by merging, in order, the defaults, `RangeStore.json`,
    /// `RangeStore.toml`, `RangeStore.yaml`, `RangeStore.yml` and environment
    /// variables prefixed with `RANGESTORE_`. Later sources win.
    pub fn load() -> Result<Settings, StoreError> {
        Figment::from(Settings::default())
            .merge(Json::file("RangeStore.json"))
            .merge(Toml::file("RangeStore.toml"))
            .merge(Yaml::file("RangeStore.yaml"))
            .merge(Yaml::file("RangeStore.yml"))
            .admerge(Env::prefixed("RANGESTORE_"))
            .extract()
            .map_err(|e| StoreError::InvalidConfigurationFormat(Box::new(e)))
    }
}

impl Provider for Settings {
    fn metadata(&self) -> Metadata {
        Metadata::named("rangestore settings")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        figment::providers::Serialized::defaults(self.clone()).data()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            merge_watch_min_backoff: Duration::from_millis(10),
            merge_watch_max_backoff: Duration::from_secs(1),
            merge_watch_timeout: None,
            max_snapshot_bytes: None,
        }
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    let duration_str = if secs > 0 && millis > 0 {
        format!("{secs}s+{millis:03}ms")
    } else if millis > 0 {
        format!("{millis:03}ms")
    } else {
        format!("{secs}s")
    };
    serializer.serialize_str(&duration_str)
}

fn serialize_option_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}
