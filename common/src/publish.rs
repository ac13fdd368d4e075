use log::trace;

use crate::topics::TopicLayout;

/// Outbound event transport. Delivery is best effort; implementations log
/// their own failures and never report them back.
pub trait EventSink {
    fn emit(&mut self, name: &str, payload: &str);
}

pub struct Publisher<E> {
    layout: TopicLayout,
    sink: E,
}

impl<E: EventSink> Publisher<E> {
    pub fn new(layout: TopicLayout, sink: E) -> Self {
        Self { layout, sink }
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut E {
        &mut self.sink
    }

    pub fn publish(&mut self, topic: &str, payload: &str) {
        let name = self.layout.event(topic);
        trace!("PUBLISH <{name}>: {payload}");
        self.sink.emit(&name, payload);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::EventSink;

    /// Sink that records every event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub events: Vec<(String, String)>,
    }

    impl RecordingSink {
        pub fn count(&self, name: &str) -> usize {
            self.events.iter().filter(|(n, _)| n == name).count()
        }

        pub fn payloads(&self, name: &str) -> Vec<&str> {
            self.events
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, p)| p.as_str())
                .collect()
        }

        pub fn names(&self) -> Vec<&str> {
            self.events.iter().map(|(n, _)| n.as_str()).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&mut self, name: &str, payload: &str) {
            self.events.push((name.to_string(), payload.to_string()));
        }
    }
}
