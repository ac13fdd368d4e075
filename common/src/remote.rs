use std::collections::BTreeMap;

use crate::{
    publish::EventSink,
    reading::Transducer,
    station::Station,
    store::{ConfigChange, ConfigStorage, SetOutcome},
};

pub const FN_ENABLE: &str = "enable";
pub const FN_DISABLE: &str = "disable";
pub const FN_ENABLE_DEEP_SLEEP: &str = "enableDeepSleep";
pub const FN_DISABLE_DEEP_SLEEP: &str = "disableDeepSleep";
pub const FN_SET_DELAY: &str = "setDelay";
pub const VAR_CONFIG: &str = "config";

pub type FunctionHandler<S, E, T> = fn(&mut Station<S, E, T>, &str) -> SetOutcome;
pub type VariableReader<S, E, T> = fn(&Station<S, E, T>) -> String;

/// Named remote-callable functions and readable variables, bound once at
/// startup.
pub struct RemoteControlSurface<S, E, T> {
    functions: BTreeMap<&'static str, FunctionHandler<S, E, T>>,
    variables: BTreeMap<&'static str, VariableReader<S, E, T>>,
}

impl<S, E, T> RemoteControlSurface<S, E, T>
where
    S: ConfigStorage,
    E: EventSink,
    T: Transducer,
{
    pub fn new() -> Self {
        let mut surface = Self {
            functions: BTreeMap::new(),
            variables: BTreeMap::new(),
        };

        surface.function(FN_ENABLE, |station, _| {
            station.apply(ConfigChange::Enabled(true))
        });
        surface.function(FN_DISABLE, |station, _| {
            station.apply(ConfigChange::Enabled(false))
        });
        surface.function(FN_ENABLE_DEEP_SLEEP, |station, _| {
            station.apply(ConfigChange::DeepSleep(true))
        });
        surface.function(FN_DISABLE_DEEP_SLEEP, |station, _| {
            station.apply(ConfigChange::DeepSleep(false))
        });
        surface.function(FN_SET_DELAY, |station, argument| {
            station.set_delay_from_input(argument)
        });
        surface.variable(VAR_CONFIG, |station| station.snapshot().to_string());

        surface
    }

    pub fn function(&mut self, name: &'static str, handler: FunctionHandler<S, E, T>) {
        self.functions.insert(name, handler);
    }

    pub fn variable(&mut self, name: &'static str, reader: VariableReader<S, E, T>) {
        self.variables.insert(name, reader);
    }

    pub fn function_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.keys().copied()
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.variables.keys().copied()
    }

    /// Invokes a named function. `None` when nothing is registered under `name`.
    pub fn call(
        &self,
        station: &mut Station<S, E, T>,
        name: &str,
        argument: &str,
    ) -> Option<SetOutcome> {
        let handler = self.functions.get(name)?;
        Some(handler(station, argument))
    }

    pub fn read(&self, station: &Station<S, E, T>, name: &str) -> Option<String> {
        let reader = self.variables.get(name)?;
        Some(reader(station))
    }
}

impl<S, E, T> Default for RemoteControlSurface<S, E, T>
where
    S: ConfigStorage,
    E: EventSink,
    T: Transducer,
{
    fn default() -> Self {
        Self::new()
    }
}
