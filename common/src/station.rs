use log::{info, warn};

use crate::{
    config::DeviceConfig,
    duty::{DutyAction, DutyCycleController, DutyState, PowerControl, WakeCause},
    publish::{EventSink, Publisher},
    reading::{Reading, SensorReader, Transducer},
    store::{ConfigChange, ConfigStorage, ConfigStore, SetOutcome},
    topics::{
        TOPIC_DEW_POINT, TOPIC_ERROR, TOPIC_HEAT_INDEX, TOPIC_HUMIDITY, TOPIC_TEMPERATURE,
        TOPIC_WARNING,
    },
};

pub const MISCONFIGURED_WARNING: &str = "Call enable() to enable deep sleep";
pub const SENSOR_READ_ERROR: &str = "Failed to read from DHT sensor!";

#[derive(Debug, Clone)]
pub struct StationOptions {
    pub defaults: DeviceConfig,
    pub wake_pin: u8,
    pub publish_heat_index: bool,
}

impl Default for StationOptions {
    fn default() -> Self {
        Self {
            defaults: DeviceConfig::default(),
            wake_pin: 33,
            publish_heat_index: false,
        }
    }
}

/// The single owned device state: config record, publisher, sensor and duty
/// cycle. The duty loop and remote calls both borrow it mutably, one at a time.
pub struct Station<S, E, T> {
    store: ConfigStore<S>,
    publisher: Publisher<E>,
    sensor: SensorReader<T>,
    duty: DutyCycleController,
    publish_heat_index: bool,
}

impl<S, E, T> Station<S, E, T>
where
    S: ConfigStorage,
    E: EventSink,
    T: Transducer,
{
    pub fn new(storage: S, publisher: Publisher<E>, transducer: T, options: StationOptions) -> Self {
        Self {
            store: ConfigStore::new(storage, options.defaults),
            publisher,
            sensor: SensorReader::new(transducer),
            duty: DutyCycleController::new(options.wake_pin),
            publish_heat_index: options.publish_heat_index,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        self.store.config()
    }

    pub fn snapshot(&self) -> &str {
        self.store.snapshot()
    }

    pub fn state(&self) -> DutyState {
        DutyState::from_config(self.store.config())
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn publisher(&self) -> &Publisher<E> {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut Publisher<E> {
        &mut self.publisher
    }

    pub fn sensor(&self) -> &SensorReader<T> {
        &self.sensor
    }

    pub fn last_read_ms(&self) -> Option<u64> {
        self.duty.last_read_ms()
    }

    /// Loads the durable record and resets it when it was written by another
    /// firmware version.
    pub fn load_config(&mut self) -> DeviceConfig {
        let loaded = self.store.load();
        let config = self.store.validate_or_reset(loaded, &mut self.publisher);
        info!("Config: {}", self.store.snapshot());
        config
    }

    /// Boot-time liveness read, taken regardless of the duty state.
    pub fn initial_read(&mut self, now_ms: u64) {
        info!("Performing initial read");
        self.sample_and_publish();
        self.duty.record_read(now_ms);
    }

    pub fn tick<P: PowerControl>(&mut self, now_ms: u64, power: &mut P) {
        match self.duty.tick(self.store.config(), now_ms) {
            DutyAction::None => {}
            DutyAction::Warn => {
                warn!("{MISCONFIGURED_WARNING}");
                self.publisher.publish(TOPIC_WARNING, MISCONFIGURED_WARNING);
            }
            DutyAction::Sample => {
                self.sample_and_publish();
                self.duty.record_read(now_ms);
            }
            DutyAction::Suspend { duration, wake_pin } => {
                info!("Sleeping for {}ms", self.store.config().delay_ms);
                let wake = power.suspend(duration, wake_pin);
                if wake.cause == WakeCause::WakePin {
                    info!("woken early by pin {wake_pin} after {:?}", wake.elapsed);
                }
                self.sample_and_publish();
                let elapsed_ms = u64::try_from(wake.elapsed.as_millis()).unwrap_or(u64::MAX);
                self.duty.record_read(now_ms.saturating_add(elapsed_ms));
            }
        }
    }

    pub fn apply(&mut self, change: ConfigChange) -> SetOutcome {
        self.store.set(change, &mut self.publisher)
    }

    pub fn set_delay_from_input(&mut self, input: &str) -> SetOutcome {
        self.store.set_delay_from_input(input, &mut self.publisher)
    }

    /// One sensor pass. An invalid reading publishes a single error and no
    /// metrics.
    pub fn sample_and_publish(&mut self) -> Option<Reading> {
        let reading = match self.sensor.read() {
            Ok(reading) => reading,
            Err(_) => {
                warn!("{SENSOR_READ_ERROR}");
                self.publisher.publish(TOPIC_ERROR, SENSOR_READ_ERROR);
                return None;
            }
        };

        info!(
            "Humid: {:.2}% - Temp: {:.2} C / {:.2} F / {:.2} K - DewP: {:.2} C",
            reading.humidity,
            reading.temperature_c,
            reading.temperature_f,
            reading.temperature_k,
            reading.dew_point_c
        );

        self.publisher
            .publish(TOPIC_HUMIDITY, &format!("{:.2}", reading.humidity));
        self.publisher
            .publish(TOPIC_TEMPERATURE, &format!("{:.2}", reading.temperature_f));
        self.publisher
            .publish(TOPIC_DEW_POINT, &format!("{:.2}", reading.dew_point_c));
        if self.publish_heat_index {
            self.publisher
                .publish(TOPIC_HEAT_INDEX, &format!("{:.2}", reading.heat_index_f));
        }

        Some(reading)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::{Station, StationOptions};
    use crate::{
        duty::{PowerControl, WakeCause, WakeEvent},
        publish::{testing::RecordingSink, Publisher},
        reading::testing::ScriptedTransducer,
        store::testing::MemoryStorage,
        topics::TopicLayout,
    };

    pub type TestStation = Station<MemoryStorage, RecordingSink, ScriptedTransducer>;

    pub fn station_with(storage: MemoryStorage, options: StationOptions) -> TestStation {
        Station::new(
            storage,
            Publisher::new(TopicLayout::new("worm", "mindflayer"), RecordingSink::default()),
            ScriptedTransducer::steady(48.5, 21.0),
            options,
        )
    }

    /// Records suspend requests and wakes either on the timer or early.
    #[derive(Debug, Default)]
    pub struct FakePower {
        pub suspends: Vec<(Duration, u8)>,
        pub early_wake_after: Option<Duration>,
    }

    impl PowerControl for FakePower {
        fn suspend(&mut self, duration: Duration, wake_pin: u8) -> WakeEvent {
            self.suspends.push((duration, wake_pin));
            match self.early_wake_after {
                Some(elapsed) if elapsed < duration => WakeEvent {
                    cause: WakeCause::WakePin,
                    elapsed,
                },
                _ => WakeEvent {
                    cause: WakeCause::Timer,
                    elapsed: duration,
                },
            }
        }
    }
}
