/// Raw transducer output. Either field is NaN when the read failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub humidity: f32,
    pub temperature_c: f32,
}

impl RawSample {
    pub const INVALID: Self = Self {
        humidity: f32::NAN,
        temperature_c: f32::NAN,
    };
}

/// Blocking humidity/temperature transducer (DHT22 on hardware).
pub trait Transducer {
    fn sample(&mut self) -> RawSample;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub humidity: f32,
    pub temperature_c: f32,
    pub temperature_f: f32,
    pub temperature_k: f32,
    pub dew_point_c: f32,
    pub heat_index_f: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidReading;

impl Reading {
    pub fn from_sample(sample: RawSample) -> Result<Self, InvalidReading> {
        let RawSample {
            humidity,
            temperature_c,
        } = sample;
        if humidity.is_nan() || temperature_c.is_nan() {
            return Err(InvalidReading);
        }

        let temperature_f = celsius_to_fahrenheit(temperature_c);
        Ok(Self {
            humidity,
            temperature_c,
            temperature_f,
            temperature_k: temperature_c + 273.15,
            dew_point_c: dew_point_c(temperature_c, humidity),
            heat_index_f: heat_index_f(temperature_f, humidity),
        })
    }
}

pub struct SensorReader<T> {
    transducer: T,
}

impl<T: Transducer> SensorReader<T> {
    pub fn new(transducer: T) -> Self {
        Self { transducer }
    }

    pub fn transducer(&self) -> &T {
        &self.transducer
    }

    pub fn transducer_mut(&mut self) -> &mut T {
        &mut self.transducer
    }

    pub fn read(&mut self) -> Result<Reading, InvalidReading> {
        Reading::from_sample(self.transducer.sample())
    }
}

pub fn celsius_to_fahrenheit(temp_c: f32) -> f32 {
    temp_c * 9.0 / 5.0 + 32.0
}

/// Magnus approximation. Humidity is floored at 0.01% so a bone-dry reading
/// stays finite.
pub fn dew_point_c(temp_c: f32, humidity: f32) -> f32 {
    const A: f32 = 17.271;
    const B: f32 = 237.7;

    let gamma = (A * temp_c) / (B + temp_c) + (humidity.max(0.01) / 100.0).ln();
    (B * gamma) / (A - gamma)
}

/// NWS heat index: Steadman below 80°F, Rothfusz regression above.
pub fn heat_index_f(temp_f: f32, humidity: f32) -> f32 {
    let simple = 0.5 * (temp_f + 61.0 + (temp_f - 68.0) * 1.2 + humidity * 0.094);
    if (simple + temp_f) / 2.0 < 80.0 {
        return simple;
    }

    let t = temp_f;
    let rh = humidity;
    let mut hi = -42.379 + 2.049_015_2 * t + 10.143_331 * rh
        - 0.224_755_4 * t * rh
        - 0.006_837_83 * t * t
        - 0.054_817_17 * rh * rh
        + 0.001_228_74 * t * t * rh
        + 0.000_852_82 * t * rh * rh
        - 0.000_001_99 * t * t * rh * rh;

    if rh < 13.0 && (80.0..=112.0).contains(&t) {
        hi -= ((13.0 - rh) * 0.25) * ((17.0 - (t - 95.0).abs()) * 0.058_82).sqrt();
    } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
        hi += ((rh - 85.0) * 0.1) * ((87.0 - t) * 0.2);
    }
    hi
}
