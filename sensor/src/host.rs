use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use dht_station_common::{
    BackupClock, ClockAdjuster, ClockError, ConfigStorage, DeviceConfig, EventSink, Inbound,
    PowerControl, Publisher, RawSample, RemoteControlSurface, RuntimeConfig, Station,
    StationOptions, StorageError, TickTimer, TimeSource, TopicLayout, Transducer, WakeCause,
    WakeEvent, FIRMWARE_VERSION,
};

type HostStation = Station<FileStorage, MqttSink, SimulatedDht>;

#[derive(Clone)]
struct DataDir {
    root: PathBuf,
}

struct FileStorage {
    path: PathBuf,
}

struct MqttSink {
    client: AsyncClient,
}

/// Stand-in for the DHT22 on a desktop host.
#[derive(Default)]
struct SimulatedDht {
    tick: u64,
    fault_every: Option<u64>,
}

struct SystemTime;

/// Backup clock kept in memory; it free-runs from the last write.
#[derive(Default)]
struct SoftRtc {
    set_at: Option<(NaiveDateTime, Instant)>,
}

/// The simulated wake pin is driven by messages on the wake topic.
struct WakeInput {
    signals: Receiver<()>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = DataDir::new();
    let mut runtime = data_dir.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.device.sanitize();

    info!(
        "dht-station v{} (firmware record v{FIRMWARE_VERSION})",
        env!("CARGO_PKG_VERSION")
    );

    let layout = TopicLayout::new(&runtime.device.namespace, &runtime.device.name);

    let mut mqtt_options = MqttOptions::new(
        format!("dht-station-{}", runtime.device.name),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let (inbox_tx, inbox_rx) = mpsc::channel();
    let (wake_tx, wake_rx) = mpsc::channel();

    spawn_mqtt_loop(eventloop, mqtt.clone(), layout.clone(), inbox_tx, wake_tx);

    let station = tokio::task::spawn_blocking(move || {
        run_station(runtime, layout, data_dir, mqtt, inbox_rx, wake_rx)
    });

    tokio::select! {
        result = station => result.context("station loop aborted")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

fn spawn_mqtt_loop(
    mut eventloop: rumqttc::EventLoop,
    mqtt: AsyncClient,
    layout: TopicLayout,
    inbox: Sender<Inbound>,
    wake: Sender<()>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match layout.parse(&message.topic, &message.payload) {
                        Some(Inbound::Wake) => {
                            let _ = wake.send(());
                        }
                        Some(request) => {
                            if inbox.send(request).is_err() {
                                warn!("station loop is gone; dropping request");
                            }
                        }
                        None => debug!("ignoring message on {}", message.topic),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    for filter in layout.subscriptions() {
                        if let Err(err) = mqtt.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                            warn!("failed to subscribe to {filter}: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn run_station(
    runtime: RuntimeConfig,
    layout: TopicLayout,
    data_dir: DataDir,
    mqtt: AsyncClient,
    inbox: Receiver<Inbound>,
    wake: Receiver<()>,
) -> anyhow::Result<()> {
    let device = runtime.device;
    let publisher = Publisher::new(
        layout.clone(),
        MqttSink {
            client: mqtt.clone(),
        },
    );
    let transducer = SimulatedDht {
        tick: 0,
        fault_every: std::env::var("DHT_STATION_FAULT_EVERY")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|every| *every > 0),
    };

    let mut station = Station::new(
        data_dir.config_storage(),
        publisher,
        transducer,
        StationOptions {
            defaults: DeviceConfig::default(),
            wake_pin: device.wake_pin,
            publish_heat_index: device.publish_heat_index,
        },
    );
    let surface = RemoteControlSurface::new();
    info!(
        "remote functions: {}",
        surface.function_names().collect::<Vec<_>>().join(", ")
    );

    station.load_config();

    if device.rtc_enabled {
        let mut rtc = SoftRtc::default();
        match ClockAdjuster::adjust(&mut SystemTime, &mut rtc) {
            Ok(_) => {
                if let Err(err) = rtc.disable_alarms() {
                    warn!("failed to disable rtc alarms: {err}");
                }
            }
            Err(err) => warn!("rtc adjustment skipped: {err}"),
        }
    }

    thread::sleep(Duration::from_millis(device.startup_delay_ms));
    station.initial_read(monotonic_ms());

    let mut power = WakeInput { signals: wake };
    let mut timer = TickTimer::new(device.loop_interval_ms, monotonic_ms());

    loop {
        let timeout = timer.remaining(monotonic_ms());
        match inbox.recv_timeout(timeout) {
            Ok(request) => handle_request(&surface, &mut station, &mqtt, &layout, request),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("mqtt request channel closed"));
            }
        }

        let now_ms = monotonic_ms();
        if timer.poll(now_ms) {
            station.tick(now_ms, &mut power);
        }
    }
}

fn handle_request(
    surface: &RemoteControlSurface<FileStorage, MqttSink, SimulatedDht>,
    station: &mut HostStation,
    mqtt: &AsyncClient,
    layout: &TopicLayout,
    request: Inbound,
) {
    match request {
        Inbound::Call { function, argument } => {
            let Some(outcome) = surface.call(station, &function, &argument) else {
                warn!("unknown remote function `{function}`");
                return;
            };
            info!("{function}({argument}) -> {outcome:?}");
            reply(mqtt, layout.call_result(&function), outcome.code().to_string());
        }
        Inbound::Read { variable } => {
            let Some(value) = surface.read(station, &variable) else {
                warn!("unknown remote variable `{variable}`");
                return;
            };
            reply(mqtt, layout.variable(&variable), value);
        }
        Inbound::Wake => debug!("wake signal outside of sleep"),
    }
}

fn reply(mqtt: &AsyncClient, topic: String, payload: String) {
    if let Err(err) = mqtt.try_publish(topic.clone(), QoS::AtLeastOnce, false, payload) {
        warn!("failed to publish reply on {topic}: {err}");
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
        runtime.network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(namespace) = std::env::var("DHT_STATION_NAMESPACE") {
        runtime.device.namespace = namespace;
    }
    if let Ok(name) = std::env::var("DHT_STATION_DEVICE") {
        runtime.device.name = name;
    }
}

impl DataDir {
    fn new() -> Self {
        let root = std::env::var("DHT_STATION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.dht-station"));
        Self { root }
    }

    fn config_storage(&self) -> FileStorage {
        FileStorage {
            path: self.root.join("config.bin"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.root.join("runtime.json")).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl ConfigStorage for FileStorage {
    fn read(&mut self) -> Result<Vec<u8>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(raw),
            // Never written: behaves like an erased region.
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StorageError::Read(format!("{}: {err}", self.path.display()))),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::Write(format!("{}: {err}", parent.display())))?;
        }
        std::fs::write(&self.path, bytes)
            .map_err(|err| StorageError::Write(format!("{}: {err}", self.path.display())))
    }
}

impl EventSink for MqttSink {
    fn emit(&mut self, name: &str, payload: &str) {
        if let Err(err) =
            self.client
                .try_publish(name.to_string(), QoS::AtLeastOnce, false, payload.to_string())
        {
            warn!("failed to publish {name}: {err}");
        }
    }
}

impl Transducer for SimulatedDht {
    fn sample(&mut self) -> RawSample {
        self.tick = self.tick.saturating_add(1);

        // Hardware integration point: the esp32 build reads a DHT22 here.
        if self
            .fault_every
            .is_some_and(|every| self.tick % every == 0)
        {
            return RawSample::INVALID;
        }

        RawSample {
            humidity: 42.0 + (self.tick % 6) as f32 * 0.5,
            temperature_c: 20.0 + (self.tick % 8) as f32 * 0.1,
        }
    }
}

impl TimeSource for SystemTime {
    fn now(&mut self) -> Option<NaiveDateTime> {
        Some(Utc::now().naive_utc())
    }
}

impl BackupClock for SoftRtc {
    fn write(&mut self, time: NaiveDateTime) -> Result<(), ClockError> {
        self.set_at = Some((time, Instant::now()));
        Ok(())
    }

    fn read(&mut self) -> Result<NaiveDateTime, ClockError> {
        let (base, at) = self.set_at.ok_or(ClockError::NotSynced)?;
        let elapsed = chrono::Duration::from_std(at.elapsed())
            .map_err(|err| ClockError::Bus(err.to_string()))?;
        Ok(base + elapsed)
    }

    fn disable_alarms(&mut self) -> Result<(), ClockError> {
        Ok(())
    }
}

impl PowerControl for WakeInput {
    fn suspend(&mut self, duration: Duration, wake_pin: u8) -> WakeEvent {
        // Only edges during the suspend count.
        while self.signals.try_recv().is_ok() {}

        debug!("suspending for {duration:?} (wake pin {wake_pin})");
        let started = Instant::now();
        // A closed channel means the runtime is shutting down.
        let cause = match self.signals.recv_timeout(duration) {
            Ok(()) => WakeCause::WakePin,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => WakeCause::Timer,
        };

        WakeEvent {
            cause,
            elapsed: started.elapsed(),
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
