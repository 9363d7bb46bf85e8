use std::sync::Arc;

use overdrive_link_core::{
    ConnectionState, Listener, ListenerId, ListenerRegistry, Transport, TransportError, TurnType, Vehicle,
    VehicleError, READ_ENDPOINT, WRITE_ENDPOINT,
};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::codec::{decode, encode, Command};

/// A vehicle driven over the command protocol on top of any [`Transport`].
pub struct AnkiVehicle<T: Transport> {
    id: String,
    address: String,
    name: String,
    transport: Arc<T>,
    state: Mutex<ConnectionState>,
    write_endpoint: Mutex<Option<String>>,
    listeners: Arc<ListenerRegistry>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> AnkiVehicle<T> {
    pub fn new(id: impl Into<String>, address: impl Into<String>, transport: Arc<T>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            name: String::new(),
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            write_endpoint: Mutex::new(None),
            listeners: Arc::new(ListenerRegistry::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn send(&self, cmd: Command) -> Result<(), VehicleError> {
        let endpoint = self
            .write_endpoint
            .lock()
            .clone()
            .ok_or_else(|| VehicleError::NotConnected(self.id.clone()))?;
        tracing::trace!(vehicle = %self.id, opcode = cmd.opcode(), "write command");
        self.transport.write(&endpoint, encode(&cmd))?;
        Ok(())
    }

    async fn open(&self) -> Result<(), TransportError> {
        self.transport.connect().await?;

        let endpoints = self.transport.discover().await?;
        for wanted in [READ_ENDPOINT, WRITE_ENDPOINT] {
            if !endpoints.iter().any(|e| e == wanted) {
                return Err(TransportError::MissingEndpoint(wanted.to_string()));
            }
        }

        let mut rx = self.transport.subscribe(READ_ENDPOINT).await?;
        let id = self.id.clone();
        let listeners = self.listeners.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match decode(&id, OffsetDateTime::now_utc(), &frame) {
                    Ok(Some(message)) => listeners.dispatch(&message),
                    Ok(None) => tracing::trace!(vehicle = %id, opcode = frame[1], "ignored notification"),
                    Err(e) => tracing::warn!(vehicle = %id, error = %e, "dropped malformed notification"),
                }
            }
            tracing::debug!(vehicle = %id, "notification stream closed");
        });
        if let Some(old) = self.pump.lock().replace(handle) {
            old.abort();
        }

        *self.write_endpoint.lock() = Some(WRITE_ENDPOINT.to_string());
        Ok(())
    }

    /// Tears down a half-open session and falls back to disconnected.
    async fn abandon(&self) {
        *self.write_endpoint.lock() = None;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        // best effort: the session may be half open
        let _ = self.transport.disconnect().await;
        *self.state.lock() = ConnectionState::Disconnected;
    }
}

#[async_trait::async_trait]
impl<T: Transport + 'static> Vehicle for AnkiVehicle<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn connect(&self) -> Result<(), VehicleError> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(VehicleError::Other(anyhow::anyhow!("vehicle {} is already {:?}", self.id, *state)));
            }
            *state = ConnectionState::Connecting;
        }

        if let Err(e) = self.open().await {
            tracing::warn!(vehicle = %self.id, error = %e, "connect failed");
            self.abandon().await;
            return Err(VehicleError::Connection(e));
        }
        if let Err(e) = self.send(Command::SdkMode { on: true }) {
            tracing::warn!(vehicle = %self.id, error = %e, "could not enable sdk mode");
            self.abandon().await;
            return Err(e);
        }

        *self.state.lock() = ConnectionState::Connected;
        tracing::info!(vehicle = %self.id, address = %self.address, "vehicle connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VehicleError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.transport.disconnect().await?;

        *self.write_endpoint.lock() = None;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        *self.state.lock() = ConnectionState::Disconnected;
        tracing::info!(vehicle = %self.id, "vehicle disconnected");
        Ok(())
    }

    fn set_speed(&self, speed: u16, acceleration: Option<u16>) -> Result<(), VehicleError> {
        self.send(Command::set_speed(speed, acceleration))
    }

    fn set_offset(&self, offset: f32) -> Result<(), VehicleError> {
        self.send(Command::SetOffset { offset })
    }

    fn change_lane(&self, offset: f32, speed: Option<u16>, acceleration: Option<u16>) -> Result<(), VehicleError> {
        self.send(Command::change_lane(offset, speed, acceleration))
    }

    fn turn(&self, turn: TurnType) -> Result<(), VehicleError> {
        self.send(Command::Turn { turn })
    }

    fn set_sdk_mode(&self, on: bool) -> Result<(), VehicleError> {
        self.send(Command::SdkMode { on })
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
