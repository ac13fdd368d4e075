pub mod clock;
pub mod config;
pub mod duty;
pub mod publish;
pub mod reading;
pub mod remote;
pub mod station;
pub mod store;
pub mod topics;

pub use clock::{BackupClock, ClockAdjuster, ClockError, TimeSource};
pub use config::{DeviceConfig, DeviceSettings, NetworkConfig, RuntimeConfig, FIRMWARE_VERSION};
pub use duty::{
    DutyAction, DutyCycleController, DutyState, PowerControl, TickTimer, WakeArming, WakeCause,
    WakeEvent,
};
pub use publish::{EventSink, Publisher};
pub use reading::{InvalidReading, RawSample, Reading, SensorReader, Transducer};
pub use remote::RemoteControlSurface;
pub use station::{Station, StationOptions};
pub use store::{ConfigChange, ConfigStorage, ConfigStore, SetOutcome, StorageError};
pub use topics::{Inbound, TopicLayout};
