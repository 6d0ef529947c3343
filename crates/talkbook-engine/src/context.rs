use std::sync::Arc;

use crate::config::PlayerConfig;
use crate::device::CpalSinkFactory;
use crate::sink::SinkFactory;
use crate::status::{NoopObserver, StatusObserver};
use crate::stream::{HttpTransportFactory, TransportFactory};

/// Configuration plus collaborators, built once and shared by the player and
/// every fragment it opens.
#[derive(Clone)]
pub struct PlayerContext {
    pub config: PlayerConfig,
    pub sinks: Arc<dyn SinkFactory>,
    pub transports: Arc<dyn TransportFactory>,
    pub observer: Arc<dyn StatusObserver>,
}

impl PlayerContext {
    /// cpal output, HTTP transport, no status observer.
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            config,
            sinks: Arc::new(CpalSinkFactory),
            transports: Arc::new(HttpTransportFactory::new()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }
}
