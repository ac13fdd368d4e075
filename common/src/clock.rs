use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use log::info;
use thiserror::Error;

pub const DS3231_ADDRESS: u8 = 0x68;
pub const DS3231_TIME_REGISTER: u8 = 0x00;
pub const DS3231_CONTROL_REGISTER: u8 = 0x0E;
pub const DS3231_STATUS_REGISTER: u8 = 0x0F;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time source has not been synchronized")]
    NotSynced,
    #[error("rtc bus error: {0}")]
    Bus(String),
    #[error("rtc holds an invalid date/time: {0:02x?}")]
    InvalidRegisters([u8; 7]),
    #[error("year {0} is outside the rtc range 2000-2099")]
    OutOfRange(i32),
}

/// Trusted wall-clock source (network time on hardware).
pub trait TimeSource {
    fn now(&mut self) -> Option<NaiveDateTime>;
}

/// Battery-backed clock that keeps time across power loss.
pub trait BackupClock {
    fn write(&mut self, time: NaiveDateTime) -> Result<(), ClockError>;
    fn read(&mut self) -> Result<NaiveDateTime, ClockError>;
    fn disable_alarms(&mut self) -> Result<(), ClockError>;
}

pub struct ClockAdjuster;

impl ClockAdjuster {
    /// Copies the trusted time into the backup clock and returns what the
    /// clock reports afterwards.
    pub fn adjust<T, B>(source: &mut T, rtc: &mut B) -> Result<NaiveDateTime, ClockError>
    where
        T: TimeSource,
        B: BackupClock,
    {
        let now = source.now().ok_or(ClockError::NotSynced)?;
        rtc.write(now)?;
        let stored = rtc.read()?;
        info!("Set RTC time to {}", stored.format("%Y-%m-%dT%H:%M:%S"));
        Ok(stored)
    }
}

fn to_bcd(value: u32) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

fn from_bcd(value: u8) -> u32 {
    u32::from(value >> 4) * 10 + u32::from(value & 0x0F)
}

/// Packs a date/time into the seven DS3231 time-keeping registers
/// (seconds, minutes, hours 24h, weekday 1-7 from Sunday, date, month, year - 2000).
pub fn encode_ds3231(time: &NaiveDateTime) -> Result<[u8; 7], ClockError> {
    let year = time.year();
    if !(2000..=2099).contains(&year) {
        return Err(ClockError::OutOfRange(year));
    }

    Ok([
        to_bcd(time.second()),
        to_bcd(time.minute()),
        to_bcd(time.hour()),
        to_bcd(time.weekday().number_from_sunday()),
        to_bcd(time.day()),
        to_bcd(time.month()),
        to_bcd((year - 2000) as u32),
    ])
}

pub fn decode_ds3231(registers: [u8; 7]) -> Result<NaiveDateTime, ClockError> {
    let second = from_bcd(registers[0] & 0x7F);
    let minute = from_bcd(registers[1] & 0x7F);
    // Bit 6 selects 12h mode; only 24h mode is ever written.
    let hour = from_bcd(registers[2] & 0x3F);
    let day = from_bcd(registers[4] & 0x3F);
    let month = from_bcd(registers[5] & 0x1F);
    let year = 2000 + from_bcd(registers[6]) as i32;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or(ClockError::InvalidRegisters(registers))
}
