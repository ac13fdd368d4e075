use log::{info, warn};
use thiserror::Error;

use crate::{
    config::{DeviceConfig, SchemaCheck},
    publish::{EventSink, Publisher},
    topics::{TOPIC_CONFIG, TOPIC_ERROR},
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage read failed: {0}")]
    Read(String),
    #[error("storage write failed: {0}")]
    Write(String),
}

/// Fixed-size durable region holding the packed config record.
pub trait ConfigStorage {
    fn read(&mut self) -> Result<Vec<u8>, StorageError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    Enabled(bool),
    DeepSleep(bool),
    DelayMs(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Changed,
    Unchanged,
    Rejected(String),
}

impl SetOutcome {
    /// Integer handed back on the remote-invocation channel.
    pub fn code(&self) -> i32 {
        match self {
            Self::Changed => 1,
            Self::Unchanged | Self::Rejected(_) => 0,
        }
    }
}

/// Parses a delay argument by its integer prefix. Anything that is not a
/// positive value representable in `u32` yields 0.
pub fn parse_delay(input: &str) -> u32 {
    let trimmed = input.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if negative || end == 0 {
        return 0;
    }

    digits[..end].parse::<u32>().unwrap_or(0)
}

pub struct ConfigStore<S> {
    storage: S,
    compiled_version: u8,
    defaults: DeviceConfig,
    config: DeviceConfig,
    snapshot: String,
}

impl<S: ConfigStorage> ConfigStore<S> {
    pub fn new(storage: S, defaults: DeviceConfig) -> Self {
        Self {
            storage,
            compiled_version: defaults.firmware_version,
            defaults,
            config: defaults,
            snapshot: render_snapshot(&defaults),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Reads the durable record. The result may be garbage; run it through
    /// [`ConfigStore::validate_or_reset`] before trusting it.
    pub fn load(&mut self) -> DeviceConfig {
        match self.storage.read() {
            Ok(bytes) => DeviceConfig::decode(&bytes),
            Err(err) => {
                warn!("failed to read config record: {err}");
                DeviceConfig::decode(&[])
            }
        }
    }

    pub fn validate_or_reset<E: EventSink>(
        &mut self,
        loaded: DeviceConfig,
        publisher: &mut Publisher<E>,
    ) -> DeviceConfig {
        match loaded.check_schema(self.compiled_version) {
            SchemaCheck::Current(config) => {
                self.config = config;
                self.snapshot = render_snapshot(&self.config);
            }
            SchemaCheck::Unknown { found } => {
                warn!(
                    "Firmware out of date; resetting config (stored v{found}, running v{})",
                    self.compiled_version
                );
                self.config = self.defaults;
                self.save(publisher);
            }
        }
        self.config
    }

    pub fn set<E: EventSink>(
        &mut self,
        change: ConfigChange,
        publisher: &mut Publisher<E>,
    ) -> SetOutcome {
        let mut next = self.config;
        match change {
            ConfigChange::Enabled(enabled) => next.enabled = enabled,
            ConfigChange::DeepSleep(deep_sleep) => next.deep_sleep = deep_sleep,
            ConfigChange::DelayMs(0) => return reject_delay("0", publisher),
            ConfigChange::DelayMs(delay_ms) => next.delay_ms = delay_ms,
        }

        if next == self.config {
            return SetOutcome::Unchanged;
        }

        self.config = next;
        self.save(publisher);
        SetOutcome::Changed
    }

    /// Remote entry for `setDelay`: parses the raw argument, reports bad input
    /// on the error topic and otherwise applies it like any other change.
    pub fn set_delay_from_input<E: EventSink>(
        &mut self,
        input: &str,
        publisher: &mut Publisher<E>,
    ) -> SetOutcome {
        match parse_delay(input) {
            0 => reject_delay(input, publisher),
            delay_ms => self.set(ConfigChange::DelayMs(delay_ms), publisher),
        }
    }

    fn save<E: EventSink>(&mut self, publisher: &mut Publisher<E>) {
        if let Err(err) = self.storage.write(&self.config.encode()) {
            warn!("failed to persist config record: {err}");
        }
        self.snapshot = render_snapshot(&self.config);
        info!("config saved: {}", self.snapshot);
        publisher.publish(TOPIC_CONFIG, &self.snapshot);
    }
}

fn reject_delay<E: EventSink>(input: &str, publisher: &mut Publisher<E>) -> SetOutcome {
    let message = format!("setDelay() called with non-integer or non-positive value: {input}");
    warn!("{message}");
    publisher.publish(TOPIC_ERROR, &message);
    SetOutcome::Rejected(message)
}

fn render_snapshot(config: &DeviceConfig) -> String {
    serde_json::to_string(&config.snapshot_view()).unwrap_or_else(|err| {
        warn!("failed to serialize config snapshot: {err}");
        String::new()
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ConfigStorage, StorageError};

    #[derive(Debug, Default)]
    pub struct MemoryStorage {
        pub bytes: Vec<u8>,
        pub writes: usize,
        pub fail_reads: bool,
        pub fail_writes: bool,
    }

    impl MemoryStorage {
        pub fn with_bytes(bytes: &[u8]) -> Self {
            Self {
                bytes: bytes.to_vec(),
                ..Self::default()
            }
        }
    }

    impl ConfigStorage for MemoryStorage {
        fn read(&mut self) -> Result<Vec<u8>, StorageError> {
            if self.fail_reads {
                return Err(StorageError::Read("bus fault".to_string()));
            }
            Ok(self.bytes.clone())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(StorageError::Write("flash worn out".to_string()));
            }
            self.bytes = bytes.to_vec();
            self.writes += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{testing::MemoryStorage, *};
    use crate::{
        config::FIRMWARE_VERSION, publish::testing::RecordingSink, topics::TopicLayout,
    };

    const CONFIG_TOPIC: &str = "worm/mindflayer/config";
    const ERROR_TOPIC: &str = "worm/mindflayer/error";

    fn publisher() -> Publisher<RecordingSink> {
        Publisher::new(
            TopicLayout::new("worm", "mindflayer"),
            RecordingSink::default(),
        )
    }

    fn loaded_store() -> (ConfigStore<MemoryStorage>, Publisher<RecordingSink>) {
        let stored = DeviceConfig::default().encode();
        let mut store = ConfigStore::new(MemoryStorage::with_bytes(&stored), DeviceConfig::default());
        let mut publisher = publisher();
        let loaded = store.load();
        store.validate_or_reset(loaded, &mut publisher);
        (store, publisher)
    }

    #[test]
    fn parse_delay_reads_integer_prefix() {
        assert_eq!(parse_delay("60000"), 60_000);
        assert_eq!(parse_delay("  1500ms"), 1_500);
        assert_eq!(parse_delay("+42"), 42);
        assert_eq!(parse_delay("abc"), 0);
        assert_eq!(parse_delay(""), 0);
        assert_eq!(parse_delay("-5"), 0);
        assert_eq!(parse_delay("99999999999"), 0);
    }

    #[test]
    fn failed_write_still_applies_and_publishes() {
        let (mut store, mut publisher) = loaded_store();
        store.storage.fail_writes = true;

        let outcome = store.set(ConfigChange::Enabled(false), &mut publisher);

        assert_eq!(outcome, SetOutcome::Changed);
        assert!(!store.config().enabled);
        assert_eq!(store.snapshot(), r#"{"delay":900000,"deepSleep":false,"enabled":false}"#);
        assert_eq!(store.storage().writes, 0);
        assert_eq!(publisher.sink().count(CONFIG_TOPIC), 1);
        assert_eq!(
            publisher.sink().payloads(CONFIG_TOPIC),
            vec![r#"{"delay":900000,"deepSleep":false,"enabled":false}"#]
        );
    }

    #[test]
    fn matching_version_is_kept_without_publishing() {
        let stored = DeviceConfig {
            firmware_version: FIRMWARE_VERSION,
            delay_ms: 30_000,
            enabled: false,
            deep_sleep: true,
        };
        let mut store = ConfigStore::new(
            MemoryStorage::with_bytes(&stored.encode()),
            DeviceConfig::default(),
        );
        let mut publisher = publisher();

        let loaded = store.load();
        let config = store.validate_or_reset(loaded, &mut publisher);

        assert_eq!(config, stored);
        assert_eq!(store.snapshot(), r#"{"delay":30000,"deepSleep":true,"enabled":false}"#);
        assert_eq!(store.storage().writes, 0);
        assert!(publisher.sink().events.is_empty());
    }

    #[test]
    fn foreign_version_resets_to_defaults_once() {
        let foreign = DeviceConfig {
            firmware_version: 5,
            delay_ms: 10,
            enabled: false,
            deep_sleep: true,
        };
        let mut store = ConfigStore::new(
            MemoryStorage::with_bytes(&foreign.encode()),
            DeviceConfig::default(),
        );
        let mut publisher = publisher();

        let loaded = store.load();
        let config = store.validate_or_reset(loaded, &mut publisher);

        assert_eq!(config, DeviceConfig::default());
        assert_eq!(store.storage().writes, 1);
        assert_eq!(store.storage().bytes, DeviceConfig::default().encode().to_vec());
        assert_eq!(
            publisher.sink().payloads(CONFIG_TOPIC),
            vec![r#"{"delay":900000,"deepSleep":false,"enabled":true}"#]
        );
    }

    #[test]
    fn unreadable_storage_resets() {
        let mut storage = MemoryStorage::default();
        storage.fail_reads = true;
        let mut store = ConfigStore::new(storage, DeviceConfig::default());
        let mut publisher = publisher();

        let loaded = store.load();
        let config = store.validate_or_reset(loaded, &mut publisher);

        assert_eq!(config, DeviceConfig::default());
        assert_eq!(publisher.sink().count(CONFIG_TOPIC), 1);
    }

    #[test]
    fn invalid_delay_is_rejected_and_reported() {
        let (mut store, mut publisher) = loaded_store();

        for input in ["0", "abc", "", "-100"] {
            let outcome = store.set_delay_from_input(input, &mut publisher);
            assert!(matches!(outcome, SetOutcome::Rejected(_)));
            assert_eq!(outcome.code(), 0);
        }

        assert_eq!(store.config().delay_ms, 900_000);
        assert_eq!(store.storage().writes, 0);
        assert_eq!(publisher.sink().count(ERROR_TOPIC), 4);
        assert_eq!(publisher.sink().count(CONFIG_TOPIC), 0);
        assert_eq!(
            publisher.sink().payloads(ERROR_TOPIC)[1],
            "setDelay() called with non-integer or non-positive value: abc"
        );
    }

    #[test]
    fn new_delay_is_persisted_and_published_once() {
        let (mut store, mut publisher) = loaded_store();

        let outcome = store.set_delay_from_input("60000", &mut publisher);

        assert_eq!(outcome, SetOutcome::Changed);
        assert_eq!(outcome.code(), 1);
        assert_eq!(store.config().delay_ms, 60_000);
        assert_eq!(
            DeviceConfig::decode(&store.storage().bytes).delay_ms,
            60_000
        );
        assert_eq!(
            publisher.sink().payloads(CONFIG_TOPIC),
            vec![r#"{"delay":60000,"deepSleep":false,"enabled":true}"#]
        );
    }

    #[test]
    fn zero_delay_change_is_rejected() {
        let (mut store, mut publisher) = loaded_store();

        let outcome = store.set(ConfigChange::DelayMs(0), &mut publisher);

        assert!(matches!(outcome, SetOutcome::Rejected(_)));
        assert_eq!(store.config().delay_ms, 900_000);
        assert_eq!(publisher.sink().count(ERROR_TOPIC), 1);
    }

    #[test]
    fn same_delay_is_unchanged() {
        let (mut store, mut publisher) = loaded_store();

        let outcome = store.set_delay_from_input("900000", &mut publisher);

        assert_eq!(outcome, SetOutcome::Unchanged);
        assert_eq!(store.storage().writes, 0);
        assert!(publisher.sink().events.is_empty());
    }

    #[test]
    fn boolean_changes_are_idempotent() {
        let (mut store, mut publisher) = loaded_store();

        assert_eq!(
            store.set(ConfigChange::Enabled(true), &mut publisher),
            SetOutcome::Unchanged
        );
        assert_eq!(
            store.set(ConfigChange::DeepSleep(false), &mut publisher),
            SetOutcome::Unchanged
        );
        assert_eq!(store.storage().writes, 0);
        assert!(publisher.sink().events.is_empty());

        assert_eq!(
            store.set(ConfigChange::DeepSleep(true), &mut publisher),
            SetOutcome::Changed
        );
        assert_eq!(
            store.set(ConfigChange::DeepSleep(true), &mut publisher),
            SetOutcome::Unchanged
        );
        assert_eq!(store.storage().writes, 1);
        assert_eq!(publisher.sink().count(CONFIG_TOPIC), 1);
        assert!(store.snapshot().contains(r#""deepSleep":true"#));
    }
}
