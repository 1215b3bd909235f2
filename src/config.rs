//! Runtime configuration.
//!
//! [`Config`] is the typed tree loaded from and saved to RON files. At runtime
//! it lives inside a [`ConfigStore`], which lets any thread read it, change
//! single fields by dotted path (`"tracker.jpeg_quality"`) and subscribe to
//! those changes.

use crate::error::{Error, Result};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// The whole configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub eyeloop: EyeloopConfig,
}

/// Settings for worker supervision, pairing and the preview paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Frame source the workers read from.
    pub importer_name: String,
    pub sharedmem_name_left: String,
    pub sharedmem_name_right: String,
    /// Shared frame size as (height, width), one byte per pixel.
    pub memory_shape_left: (u32, u32),
    pub memory_shape_right: (u32, u32),
    pub blink_calibration_left: String,
    pub blink_calibration_right: String,
    /// Worker binary. When unset, `eye-worker` next to the current executable.
    pub worker_executable: Option<PathBuf>,
    /// Workers generate their own frames instead of reading shared memory.
    pub test_mode: bool,
    pub health_check_interval_ms: u64,
    /// Most unmatched frame ids kept per pairing map.
    pub sync_buffer_size: usize,
    pub eyeloop_start_timeout_ms: u64,
    pub resp_q_timeout_ms: u64,
    pub process_join_timeout_ms: u64,
    pub shm_closed_timeout_ms: u64,
    pub jpeg_quality: u8,
    pub png_compression: u8,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            importer_name: "shared_memory".to_string(),
            sharedmem_name_left: "eye_left_frame".to_string(),
            sharedmem_name_right: "eye_right_frame".to_string(),
            memory_shape_left: (1080, 960),
            memory_shape_right: (1080, 960),
            blink_calibration_left: "blink_calibration/blink_calibration_cropL.ron".to_string(),
            blink_calibration_right: "blink_calibration/blink_calibration_cropR.ron".to_string(),
            worker_executable: None,
            test_mode: false,
            health_check_interval_ms: 3000,
            sync_buffer_size: 32,
            eyeloop_start_timeout_ms: 10_000,
            resp_q_timeout_ms: 100,
            process_join_timeout_ms: 1000,
            shm_closed_timeout_ms: 5000,
            jpeg_quality: 15,
            png_compression: 3,
        }
    }
}

impl TrackerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn eyeloop_start_timeout(&self) -> Duration {
        Duration::from_millis(self.eyeloop_start_timeout_ms)
    }

    pub fn resp_q_timeout(&self) -> Duration {
        Duration::from_millis(self.resp_q_timeout_ms)
    }

    pub fn process_join_timeout(&self) -> Duration {
        Duration::from_millis(self.process_join_timeout_ms)
    }

    pub fn shm_closed_timeout(&self) -> Duration {
        Duration::from_millis(self.shm_closed_timeout_ms)
    }

    /// Resolves the worker executable path.
    pub fn worker_path(&self) -> PathBuf {
        if let Some(path) = &self.worker_executable {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("eye-worker")))
            .unwrap_or_else(|| PathBuf::from("eye-worker"))
    }
}

/// Per-eye tracking parameters forwarded to running workers. Fields are
/// prefixed with the eye they apply to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EyeloopConfig {
    pub left_threshold: u8,
    pub right_threshold: u8,
    pub left_min_area: u32,
    pub right_min_area: u32,
    pub left_auto_search: bool,
    pub right_auto_search: bool,
}

impl Default for EyeloopConfig {
    fn default() -> Self {
        Self {
            left_threshold: 60,
            right_threshold: 60,
            left_min_area: 40,
            right_min_area: 40,
            left_auto_search: true,
            right_auto_search: true,
        }
    }
}

impl EyeloopConfig {
    /// Every field with its current value, sorted by name.
    pub fn fields(&self) -> Vec<(String, Value)> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

impl Config {
    /// Reads a RON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(ron::de::from_str(&text)?)
    }

    /// Writes this config as pretty RON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// Called with (path, old value, new value) after a successful change.
pub type ConfigCallback = Box<dyn Fn(&str, &Value, &Value) + Send + Sync>;

/// Returned by [`ConfigStore::subscribe`]; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    key: String,
    callback: Arc<ConfigCallback>,
}

/// Shared, thread-safe holder of the live [`Config`].
pub struct ConfigStore {
    config: RwLock<Config>,
    subscriptions: Mutex<(u64, Vec<Subscription>)>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
            subscriptions: Mutex::new((0, Vec::new())),
        }
    }

    /// A copy of the current config.
    pub fn snapshot(&self) -> Config {
        self.config.read().clone()
    }

    /// Runs `f` against the current config while holding the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.config.read())
    }

    /// Sets one field by dotted path, converting `value` to the field's type.
    ///
    /// Strings are accepted for booleans (`"on"`, `"false"`, ...) and numbers.
    /// Setting a field to its current value changes nothing and notifies no
    /// one. Subscribers of the section and of the exact path are called after
    /// the lock is released.
    pub fn set(&self, path: &str, value: &Value) -> Result<()> {
        let (section, field) = split_path(path)?;

        let (old, new) = {
            let mut config = self.config.write();
            let mut tree = serde_json::to_value(&*config)?;
            let slot = tree
                .get_mut(section)
                .and_then(|s| s.get_mut(field))
                .ok_or_else(|| Error::UnknownConfigPath(path.to_string()))?;

            let new = coerce(path, slot, value)?;
            if *slot == new {
                return Ok(());
            }
            let old = std::mem::replace(slot, new.clone());

            *config = serde_json::from_value(tree).map_err(|e| Error::InvalidConfigValue {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            (old, new)
        };

        debug!("Config : {path} changed from {old} to {new}.");
        self.notify(section, path, &old, &new);
        Ok(())
    }

    /// Registers `callback` for a whole section (`"eyeloop"`) or one field
    /// (`"eyeloop.left_threshold"`).
    pub fn subscribe(&self, key: &str, callback: ConfigCallback) -> SubscriptionId {
        let mut subscriptions = self.subscriptions.lock();
        let id = SubscriptionId(subscriptions.0);
        subscriptions.0 += 1;
        subscriptions.1.push(Subscription {
            id,
            key: key.to_string(),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().1.retain(|s| s.id != id);
    }

    fn notify(&self, section: &str, path: &str, old: &Value, new: &Value) {
        let targets: Vec<Arc<ConfigCallback>> = self
            .subscriptions
            .lock()
            .1
            .iter()
            .filter(|s| s.key == section || s.key == path)
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in targets {
            callback(path, old, new);
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    match path.split_once('.') {
        Some((section, field)) if !section.is_empty() && !field.is_empty() && !field.contains('.') => {
            Ok((section, field))
        }
        _ => Err(Error::UnknownConfigPath(path.to_string())),
    }
}

/// Converts `value` to the JSON shape of `current`. Compound and optional
/// fields are passed through and checked when the tree is rebuilt.
fn coerce(path: &str, current: &Value, value: &Value) -> Result<Value> {
    let invalid = |reason: String| Error::InvalidConfigValue {
        path: path.to_string(),
        reason,
    };

    match current {
        Value::Bool(_) => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
                "0" | "false" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(invalid(format!("cannot parse bool from '{s}'"))),
            },
            other => Err(invalid(format!("expected bool, got {other}"))),
        },
        Value::Number(n) => {
            let number = match value {
                Value::Number(v) => v.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }
            .ok_or_else(|| invalid(format!("expected number, got {value}")))?;

            if n.is_f64() {
                serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .ok_or_else(|| invalid(format!("{number} is not finite")))
            } else if number < 0.0 {
                Ok(Value::from(number.trunc() as i64))
            } else {
                Ok(Value::from(number.trunc() as u64))
            }
        }
        Value::String(_) => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Ok(Value::String(other.to_string())),
        },
        _ => Ok(value.clone()),
    }
}

/// Logs and swallows a failed `set`, the way inbound config messages are
/// applied.
pub fn apply_or_warn(store: &ConfigStore, path: &str, value: &Value) {
    if let Err(e) = store.set(path, value) {
        warn!("Config : failed to set {path} to {value} : {e}.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_match_device() {
        let config = Config::default();
        assert_eq!(config.tracker.jpeg_quality, 15);
        assert_eq!(config.tracker.png_compression, 3);
        assert_eq!(config.tracker.sharedmem_name_left, "eye_left_frame");
        assert_eq!(config.tracker.memory_shape_right, (1080, 960));
        assert_eq!(config.tracker.health_check_interval(), Duration::from_secs(3));
    }

    #[test]
    fn save_then_load_ron_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vrcore.ron");

        let mut config = Config::default();
        config.tracker.test_mode = true;
        config.eyeloop.right_threshold = 90;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.ron");
        fs::write(&path, "(tracker: (jpeg_quality: 40))").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tracker.jpeg_quality, 40);
        assert_eq!(config.tracker.png_compression, 3);
        assert_eq!(config.eyeloop, EyeloopConfig::default());
    }

    #[test]
    fn set_coerces_strings() {
        let store = ConfigStore::default();
        store.set("tracker.test_mode", &json!("on")).unwrap();
        store.set("tracker.jpeg_quality", &json!("42")).unwrap();
        store.set("eyeloop.left_threshold", &json!(70.9)).unwrap();

        let config = store.snapshot();
        assert!(config.tracker.test_mode);
        assert_eq!(config.tracker.jpeg_quality, 42);
        assert_eq!(config.eyeloop.left_threshold, 70);
    }

    #[test]
    fn set_rejects_bad_paths_and_values() {
        let store = ConfigStore::default();
        assert!(matches!(
            store.set("tracker.nope", &json!(1)),
            Err(Error::UnknownConfigPath(_))
        ));
        assert!(matches!(
            store.set("tracker", &json!(1)),
            Err(Error::UnknownConfigPath(_))
        ));
        assert!(matches!(
            store.set("tracker.test_mode", &json!("maybe")),
            Err(Error::InvalidConfigValue { .. })
        ));
        // Out of range for a u8 field.
        assert!(matches!(
            store.set("tracker.jpeg_quality", &json!(1000)),
            Err(Error::InvalidConfigValue { .. })
        ));
        assert_eq!(store.snapshot(), Config::default());
    }

    #[test]
    fn subscribers_see_section_and_exact_path() {
        let store = ConfigStore::default();
        let section_hits = Arc::new(AtomicUsize::new(0));
        let field_hits = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&section_hits);
        let section = store.subscribe(
            "eyeloop",
            Box::new(move |path, old, new| {
                assert_eq!(path, "eyeloop.right_threshold");
                assert_eq!(old, &json!(60));
                assert_eq!(new, &json!(80));
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let hits = Arc::clone(&field_hits);
        store.subscribe(
            "eyeloop.right_threshold",
            Box::new(move |_, _, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.set("eyeloop.right_threshold", &json!(80)).unwrap();
        // Unchanged value: no notification.
        store.set("eyeloop.right_threshold", &json!(80)).unwrap();
        // Other section: no notification.
        store.set("tracker.jpeg_quality", &json!(20)).unwrap();

        assert_eq!(section_hits.load(Ordering::SeqCst), 1);
        assert_eq!(field_hits.load(Ordering::SeqCst), 1);

        store.unsubscribe(section);
        store.set("eyeloop.right_threshold", &json!(81)).unwrap();
        assert_eq!(section_hits.load(Ordering::SeqCst), 1);
        assert_eq!(field_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn eyeloop_fields_are_listed() {
        let fields = EyeloopConfig::default().fields();
        assert!(fields.contains(&("left_threshold".to_string(), json!(60))));
        assert!(fields.contains(&("right_auto_search".to_string(), json!(true))));
        assert_eq!(fields.len(), 6);
    }
}
