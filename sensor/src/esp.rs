use core::convert::TryInto;
use std::{
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use dht_sensor::dht22;
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, BLOCK},
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use dht_station_common::{
    clock::{
        decode_ds3231, encode_ds3231, DS3231_ADDRESS, DS3231_CONTROL_REGISTER,
        DS3231_STATUS_REGISTER, DS3231_TIME_REGISTER,
    },
    BackupClock, ClockAdjuster, ClockError, ConfigStorage, DeviceConfig, EventSink, Inbound,
    PowerControl, Publisher, RawSample, RemoteControlSurface, RuntimeConfig, Station,
    StationOptions, StorageError, TickTimer, TimeSource, TopicLayout, Transducer, WakeArming,
    WakeCause, WakeEvent,
    FIRMWARE_VERSION,
};

const NVS_NAMESPACE: &str = "dht-station";
const NVS_CONFIG_KEY: &str = "config";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const DHT22_PIN: u8 = 16;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const SNTP_SYNC_TIMEOUT: Duration = Duration::from_secs(15);

type EspStation = Station<NvsStorage, MqttSink, Dht22>;

/// Interrupt enable bits for both DS3231 alarms.
const DS3231_ALARM_ENABLE_MASK: u8 = 0b0000_0011;
/// Alarm fired flags.
const DS3231_ALARM_FLAG_MASK: u8 = 0b0000_0011;

struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
}

struct MqttSink {
    client: EspMqttClient<'static>,
}

struct Dht22 {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

struct Ds3231 {
    i2c: I2cDriver<'static>,
}

struct SntpTime {
    sntp: EspSntp<'static>,
}

struct LightSleep;

enum MqttMessage {
    Connected,
    Request(Inbound),
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.device.sanitize();

    info!(
        "dht-station v{} (firmware record v{FIRMWARE_VERSION})",
        env!("CARGO_PKG_VERSION")
    );

    let Peripherals {
        modem,
        pins,
        i2c0,
        ..
    } = Peripherals::take()?;

    let dht = Dht22::new(pins.gpio16.downgrade()).context("failed to initialize DHT22")?;

    let _wifi = connect_wifi(modem, sys_loop, nvs_partition.clone(), &runtime)
        .context("wifi startup failed")?;

    let layout = TopicLayout::new(&runtime.device.namespace, &runtime.device.name);
    let (client, conn) = create_mqtt_client(&runtime)?;
    let (inbox_tx, inbox_rx) = mpsc::channel();
    spawn_mqtt_poll(conn, layout.clone(), inbox_tx)?;

    let storage = NvsStorage {
        nvs: EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?,
    };
    let mut station = Station::new(
        storage,
        Publisher::new(layout.clone(), MqttSink { client }),
        dht,
        StationOptions {
            defaults: DeviceConfig::default(),
            wake_pin: runtime.device.wake_pin,
            publish_heat_index: runtime.device.publish_heat_index,
        },
    );
    let surface = RemoteControlSurface::new();

    station.load_config();

    if runtime.device.rtc_enabled {
        if let Err(err) = adjust_rtc(i2c0, pins.gpio21.downgrade(), pins.gpio22.downgrade()) {
            warn!("rtc adjustment skipped: {err:#}");
        }
    }

    thread::sleep(Duration::from_millis(runtime.device.startup_delay_ms));
    station.initial_read(monotonic_ms());

    let mut power = LightSleep;
    let mut timer = TickTimer::new(runtime.device.loop_interval_ms, monotonic_ms());

    loop {
        let timeout = timer.remaining(monotonic_ms());
        match inbox_rx.recv_timeout(timeout) {
            Ok(MqttMessage::Connected) => subscribe(&mut station, &layout),
            Ok(MqttMessage::Request(request)) => {
                handle_request(&surface, &mut station, &layout, request)
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("mqtt poll thread exited"));
            }
        }

        let now_ms = monotonic_ms();
        if timer.poll(now_ms) {
            station.tick(now_ms, &mut power);
        }
    }
}

fn spawn_mqtt_poll(
    mut conn: EspMqttConnection,
    layout: TopicLayout,
    inbox: Sender<MqttMessage>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        let _ = inbox.send(MqttMessage::Connected);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        ..
                    } => {
                        if let Some(request) = layout.parse(topic, data) {
                            let _ = inbox.send(MqttMessage::Request(request));
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt poll error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt thread")?;
    Ok(())
}

fn subscribe(station: &mut EspStation, layout: &TopicLayout) {
    let client = &mut station.publisher_mut().sink_mut().client;
    for filter in layout.subscriptions() {
        if let Err(err) = client.subscribe(&filter, QoS::AtMostOnce) {
            warn!("failed to subscribe to {filter}: {err:?}");
        }
    }
}

fn handle_request(
    surface: &RemoteControlSurface<NvsStorage, MqttSink, Dht22>,
    station: &mut EspStation,
    layout: &TopicLayout,
    request: Inbound,
) {
    let (topic, payload) = match request {
        Inbound::Call { function, argument } => {
            let Some(outcome) = surface.call(station, &function, &argument) else {
                warn!("unknown remote function `{function}`");
                return;
            };
            info!("{function}({argument}) -> {outcome:?}");
            (layout.call_result(&function), outcome.code().to_string())
        }
        Inbound::Read { variable } => {
            let Some(value) = surface.read(station, &variable) else {
                warn!("unknown remote variable `{variable}`");
                return;
            };
            (layout.variable(&variable), value)
        }
        // The wake pin is a real GPIO here.
        Inbound::Wake => return,
    };

    station.publisher_mut().sink_mut().emit(&topic, &payload);
}

fn adjust_rtc(
    i2c: esp_idf_hal::i2c::I2C0,
    sda: AnyIOPin,
    scl: AnyIOPin,
) -> anyhow::Result<()> {
    let config = I2cConfig::new().baudrate(Hertz(100_000));
    let mut rtc = Ds3231 {
        i2c: I2cDriver::new(i2c, sda, scl, &config)?,
    };

    let mut time = SntpTime {
        sntp: EspSntp::new_default()?,
    };
    time.wait_for_sync(SNTP_SYNC_TIMEOUT);

    ClockAdjuster::adjust(&mut time, &mut rtc)?;
    rtc.disable_alarms()?;
    Ok(())
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.trim().is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
            runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    runtime: &RuntimeConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let network = &runtime.network;
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow::Error::from(err)
            .context(format!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed")));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!(
        "mqtt://{}:{}",
        runtime.network.mqtt_host, runtime.network.mqtt_port
    );
    let client_id = format!("dht-station-{}", runtime.device.name);

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if runtime.network.mqtt_user.is_empty() {
            None
        } else {
            Some(runtime.network.mqtt_user.as_str())
        },
        password: if runtime.network.mqtt_pass.is_empty() {
            None
        } else {
            Some(runtime.network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(&url, &conf)?)
}

impl ConfigStorage for NvsStorage {
    fn read(&mut self) -> Result<Vec<u8>, StorageError> {
        let mut buffer = [0_u8; 32];
        match self.nvs.get_raw(NVS_CONFIG_KEY, &mut buffer) {
            Ok(Some(bytes)) => Ok(bytes.to_vec()),
            Ok(None) => Ok(Vec::new()),
            Err(err) => Err(StorageError::Read(format!("{err:?}"))),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.nvs
            .set_raw(NVS_CONFIG_KEY, bytes)
            .map(|_| ())
            .map_err(|err| StorageError::Write(format!("{err:?}")))
    }
}

impl EventSink for MqttSink {
    fn emit(&mut self, name: &str, payload: &str) {
        if let Err(err) = self
            .client
            .enqueue(name, QoS::AtLeastOnce, false, payload.as_bytes())
        {
            warn!("failed to publish {name}: {err:?}");
        }
    }
}

impl Dht22 {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl Transducer for Dht22 {
    fn sample(&mut self) -> RawSample {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return RawSample::INVALID;
        }

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => RawSample {
                humidity: reading.relative_humidity,
                temperature_c: reading.temperature,
            },
            Err(err) => {
                warn!("DHT22 read on GPIO{DHT22_PIN} failed: {err:?}");
                RawSample::INVALID
            }
        }
    }
}

impl Ds3231 {
    fn read_register(&mut self, register: u8) -> Result<u8, ClockError> {
        let mut value = [0_u8; 1];
        self.i2c
            .write_read(DS3231_ADDRESS, &[register], &mut value, BLOCK)
            .map_err(|err| ClockError::Bus(format!("{err:?}")))?;
        Ok(value[0])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), ClockError> {
        self.i2c
            .write(DS3231_ADDRESS, &[register, value], BLOCK)
            .map_err(|err| ClockError::Bus(format!("{err:?}")))
    }
}

impl BackupClock for Ds3231 {
    fn write(&mut self, time: NaiveDateTime) -> Result<(), ClockError> {
        let registers = encode_ds3231(&time)?;
        let mut frame = [0_u8; 8];
        frame[0] = DS3231_TIME_REGISTER;
        frame[1..].copy_from_slice(&registers);
        self.i2c
            .write(DS3231_ADDRESS, &frame, BLOCK)
            .map_err(|err| ClockError::Bus(format!("{err:?}")))
    }

    fn read(&mut self) -> Result<NaiveDateTime, ClockError> {
        let mut registers = [0_u8; 7];
        self.i2c
            .write_read(DS3231_ADDRESS, &[DS3231_TIME_REGISTER], &mut registers, BLOCK)
            .map_err(|err| ClockError::Bus(format!("{err:?}")))?;
        decode_ds3231(registers)
    }

    fn disable_alarms(&mut self) -> Result<(), ClockError> {
        let control = self.read_register(DS3231_CONTROL_REGISTER)?;
        self.write_register(DS3231_CONTROL_REGISTER, control & !DS3231_ALARM_ENABLE_MASK)?;
        let status = self.read_register(DS3231_STATUS_REGISTER)?;
        self.write_register(DS3231_STATUS_REGISTER, status & !DS3231_ALARM_FLAG_MASK)
    }
}

impl SntpTime {
    fn wait_for_sync(&self, timeout: Duration) {
        let started = Instant::now();
        while self.sntp.get_sync_status() != SyncStatus::Completed {
            if started.elapsed() >= timeout {
                warn!("sntp not synchronized after {timeout:?}");
                return;
            }
            thread::sleep(Duration::from_millis(250));
        }
    }
}

impl TimeSource for SntpTime {
    fn now(&mut self) -> Option<NaiveDateTime> {
        (self.sntp.get_sync_status() == SyncStatus::Completed).then(|| Utc::now().naive_utc())
    }
}

impl PowerControl for LightSleep {
    fn suspend(&mut self, duration: Duration, wake_pin: u8) -> WakeEvent {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let started = Instant::now();

        unsafe {
            esp_idf_svc::sys::esp_sleep_disable_wakeup_source(
                esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_ALL,
            );
        }
        let timer_armed = esp_ok(
            unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) },
            "esp_sleep_enable_timer_wakeup",
        );
        let rc = if timer_armed {
            arm_wake_pin(wake_pin);
            unsafe { esp_idf_svc::sys::esp_light_sleep_start() }
        } else {
            esp_idf_svc::sys::ESP_FAIL
        };

        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("light sleep rejected (esp_err_t={rc}); waiting instead");
            thread::sleep(duration);
            return WakeEvent {
                cause: WakeCause::Timer,
                elapsed: started.elapsed(),
            };
        }

        let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
        WakeEvent {
            cause: if cause == esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 {
                WakeCause::WakePin
            } else {
                WakeCause::Timer
            },
            elapsed: started.elapsed(),
        }
    }
}

/// Arms ext0 so a falling edge on the pulled-up pin ends the sleep. ext0 is
/// level triggered, so a pin already held low is left unarmed and only the
/// timer applies.
fn arm_wake_pin(wake_pin: u8) {
    let pin = i32::from(wake_pin);

    let pulled_up = esp_ok(
        unsafe { esp_idf_svc::sys::rtc_gpio_pullup_en(pin) },
        "rtc_gpio_pullup_en",
    ) && esp_ok(
        unsafe { esp_idf_svc::sys::rtc_gpio_pulldown_dis(pin) },
        "rtc_gpio_pulldown_dis",
    );
    if !pulled_up {
        return;
    }

    let pin_high = unsafe { esp_idf_svc::sys::gpio_get_level(pin) } != 0;
    if WakeArming::for_level(pin_high) == WakeArming::TimerOnly {
        warn!("wake pin {wake_pin} is held low; sleeping on the timer only");
        return;
    }

    esp_ok(
        unsafe { esp_idf_svc::sys::esp_sleep_enable_ext0_wakeup(pin, 0) },
        "esp_sleep_enable_ext0_wakeup",
    );
}

fn esp_ok(rc: esp_idf_svc::sys::esp_err_t, call: &str) -> bool {
    if rc == esp_idf_svc::sys::ESP_OK {
        return true;
    }
    warn!("{call} failed: esp_err_t={rc}");
    false
}

fn monotonic_ms() -> u64 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    u64::try_from(micros / 1_000).unwrap_or(0)
}
