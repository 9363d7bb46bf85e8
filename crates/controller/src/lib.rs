//! Owns one installation: its vehicles, the track and the distance filter.
//!
//! The controller installs the filter's update listener once and forwards
//! every enriched message to whichever scenario handler is registered at the
//! time, so scenarios can be swapped while the filter runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;

use analysis::{DistanceFilter, ErrorSink, FilterConfig, FilterError, Track, UpdateListener};
use model::Setup;
use overdrive_link_core::{Vehicle, VehicleMessage};

/// Receives the setup record whenever the installation goes on- or offline.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, setup: &Setup) -> Result<()>;
}

/// Writes the setup record to the log.
pub struct LogPublisher;

impl StatusPublisher for LogPublisher {
    fn publish(&self, setup: &Setup) -> Result<()> {
        let record = serde_json::to_string(setup)?;
        tracing::info!(online = setup.online, %record, "setup status");
        Ok(())
    }
}

type Slot = Arc<Mutex<Option<UpdateListener>>>;

pub struct Controller {
    setup: Mutex<Setup>,
    vehicles: Vec<Arc<dyn Vehicle>>,
    filter: DistanceFilter,
    handler: Slot,
    recorder: Slot,
    publisher: Arc<dyn StatusPublisher>,
}

impl Controller {
    /// Builds the track from the setup and wires every vehicle into a new filter.
    pub fn new(setup: Setup, vehicles: Vec<Arc<dyn Vehicle>>) -> Result<Self> {
        let track = Track::new(setup.track.clone()).context("invalid track configuration")?;
        let filter = DistanceFilter::new(Arc::new(track), vehicles.clone());

        let handler: Slot = Arc::new(Mutex::new(None));
        let recorder: Slot = Arc::new(Mutex::new(None));
        let (h, r) = (handler.clone(), recorder.clone());
        filter.on_update(Arc::new(move |message: VehicleMessage| {
            // clone out of the slots so a handler may unregister itself
            let recorder = r.lock().clone();
            if let Some(recorder) = recorder {
                recorder(message.clone());
            }
            let handler = h.lock().clone();
            if let Some(handler) = handler {
                handler(message);
            }
        }));

        Ok(Self {
            setup: Mutex::new(setup),
            vehicles,
            filter,
            handler,
            recorder,
            publisher: Arc::new(LogPublisher),
        })
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_filter_config(mut self, config: FilterConfig) -> Self {
        self.filter = self.filter.with_config(config);
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.filter = self.filter.with_error_sink(errors);
        self
    }

    /// Receives every enriched message regardless of the scenario handler.
    pub fn with_recorder(self, recorder: UpdateListener) -> Self {
        *self.recorder.lock() = Some(recorder);
        self
    }

    pub fn setup(&self) -> Setup {
        self.setup.lock().clone()
    }

    pub fn filter(&self) -> &DistanceFilter {
        &self.filter
    }

    pub fn vehicles(&self) -> &[Arc<dyn Vehicle>] {
        &self.vehicles
    }

    pub fn vehicle(&self, id: &str) -> Option<&Arc<dyn Vehicle>> {
        self.vehicles.iter().find(|v| v.id() == id)
    }

    /// Replaces the scenario handler. Takes effect with the next message.
    pub fn register_update_handler(&self, handler: UpdateListener) {
        if self.handler.lock().replace(handler).is_some() {
            tracing::debug!("replaced running scenario handler");
        }
    }

    /// Returns true when a handler was registered.
    pub fn unregister_update_handler(&self) -> bool {
        self.handler.lock().take().is_some()
    }

    pub fn has_update_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Starts the filter, connects every vehicle, places each on its
    /// configured offset and publishes the setup as online.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(count = self.vehicles.len(), "using vehicles");
        for (i, v) in self.vehicles.iter().enumerate() {
            tracing::info!(index = i + 1, vehicle = %v.id(), address = %v.address(), "vehicle");
        }
        let mut i = 0;
        self.filter.track().each_piece(|piece| {
            tracing::info!(index = i, piece = piece.id(), kind = piece.kind().label(), "track piece");
            i += 1;
        });

        self.filter.start().context("start distance filter")?;

        tracing::info!("connecting vehicles");
        let results = join_all(self.vehicles.iter().map(|v| v.connect())).await;
        let mut failed = 0;
        for (v, res) in self.vehicles.iter().zip(results) {
            if let Err(e) = res {
                tracing::error!(vehicle = %v.id(), error = %e, "could not connect vehicle");
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} vehicles failed to connect", failed, self.vehicles.len());
        }

        let setup = {
            let mut setup = self.setup.lock();
            for v in &self.vehicles {
                if let Some(config) = setup.vehicle(v.id()) {
                    tracing::info!(vehicle = %v.id(), offset = config.offset, "initialize vehicle offset");
                    v.set_offset(config.offset).with_context(|| format!("set offset of {}", v.id()))?;
                }
            }
            setup.online = true;
            setup.clone()
        };
        self.publisher.publish(&setup).context("publish setup")?;
        tracing::info!(setup = %setup.uuid.simple(), "setup online");
        Ok(())
    }

    /// Interrupts the scenario, publishes the setup as offline, disconnects
    /// every vehicle and stops the filter. Failures are logged; every step runs.
    pub async fn shutdown(&self) {
        if self.unregister_update_handler() {
            tracing::info!("interrupted running scenario");
        }

        let setup = {
            let mut setup = self.setup.lock();
            setup.online = false;
            setup.clone()
        };
        tracing::info!(setup = %setup.uuid.simple(), "shutting down setup");
        if let Err(e) = self.publisher.publish(&setup) {
            tracing::error!(error = %e, "could not publish offline setup");
        }

        tracing::info!("disconnecting vehicles");
        let results = join_all(self.vehicles.iter().map(|v| v.disconnect())).await;
        for (v, res) in self.vehicles.iter().zip(results) {
            if let Err(e) = res {
                tracing::error!(vehicle = %v.id(), error = %e, "error while disconnecting vehicle");
            }
        }

        match self.filter.begin_stop() {
            Ok(stopping) => {
                // the worker drains what is still queued; keep the runtime free meanwhile
                if let Err(e) = tokio::task::spawn_blocking(move || stopping.wait()).await {
                    tracing::error!(error = %e, "could not join distance filter worker");
                }
            }
            Err(FilterError::NotStarted) => {}
            Err(e) => tracing::error!(error = %e, "could not stop distance filter"),
        }
        tracing::info!("setup disconnected");
    }
}
