pub const TOPIC_HUMIDITY: &str = "humidity";
pub const TOPIC_TEMPERATURE: &str = "temperature";
pub const TOPIC_DEW_POINT: &str = "dew_point";
pub const TOPIC_HEAT_INDEX: &str = "heat_index";
pub const TOPIC_CONFIG: &str = "config";
pub const TOPIC_WARNING: &str = "warning";
pub const TOPIC_ERROR: &str = "error";

const CALL_SEGMENT: &str = "call";
const RESULT_SEGMENT: &str = "result";
const GET_SEGMENT: &str = "get";
const VAR_SEGMENT: &str = "var";
const WAKE_SEGMENT: &str = "wake";

/// Request decoded from an incoming topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Call { function: String, argument: String },
    Read { variable: String },
    Wake,
}

/// Two-level `namespace/device` prefix shared by every topic of one station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(namespace: &str, device: &str) -> Self {
        Self {
            prefix: format!("{namespace}/{device}"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn event(&self, topic: &str) -> String {
        format!("{}/{topic}", self.prefix)
    }

    pub fn call(&self, function: &str) -> String {
        format!("{}/{CALL_SEGMENT}/{function}", self.prefix)
    }

    pub fn call_result(&self, function: &str) -> String {
        format!("{}/{CALL_SEGMENT}/{function}/{RESULT_SEGMENT}", self.prefix)
    }

    pub fn read(&self, variable: &str) -> String {
        format!("{}/{GET_SEGMENT}/{variable}", self.prefix)
    }

    pub fn variable(&self, variable: &str) -> String {
        format!("{}/{VAR_SEGMENT}/{variable}", self.prefix)
    }

    pub fn wake(&self) -> String {
        format!("{}/{WAKE_SEGMENT}", self.prefix)
    }

    /// Wildcard filters covering every request topic this station answers.
    pub fn subscriptions(&self) -> [String; 3] {
        [
            format!("{}/{CALL_SEGMENT}/+", self.prefix),
            format!("{}/{GET_SEGMENT}/+", self.prefix),
            self.wake(),
        ]
    }

    pub fn parse(&self, topic: &str, payload: &[u8]) -> Option<Inbound> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let mut segments = rest.split('/');

        let inbound = match (segments.next()?, segments.next()) {
            (CALL_SEGMENT, Some(function)) if !function.is_empty() => Inbound::Call {
                function: function.to_string(),
                argument: String::from_utf8_lossy(payload).into_owned(),
            },
            (GET_SEGMENT, Some(variable)) if !variable.is_empty() => Inbound::Read {
                variable: variable.to_string(),
            },
            (WAKE_SEGMENT, None) => Inbound::Wake,
            _ => return None,
        };

        if segments.next().is_some() {
            return None;
        }
        Some(inbound)
    }
}
