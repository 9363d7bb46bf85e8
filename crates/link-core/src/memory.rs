//! In-process transport: records written frames and lets the caller inject
//! notification frames. Used for simulations and tests.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{NotificationRx, NotificationTx, Transport, TransportError, READ_ENDPOINT, WRITE_ENDPOINT};

#[derive(Default)]
struct MemoryInner {
    connected: bool,
    fail_handshake: bool,
    fail_disconnect: bool,
    fail_writes: bool,
    subscribers: HashMap<String, NotificationTx>,
    written: Vec<(String, Bytes)>,
}

pub struct MemoryTransport {
    endpoints: Vec<String>,
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new([READ_ENDPOINT, WRITE_ENDPOINT])
    }
}

impl MemoryTransport {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub fn fail_handshake(&self, fail: bool) {
        self.inner.lock().fail_handshake = fail;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.inner.lock().fail_disconnect = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Pushes a notification frame to the subscriber of `endpoint`.
    /// Returns false when nobody is subscribed.
    pub fn notify(&self, endpoint: &str, frame: impl Into<Bytes>) -> bool {
        let inner = self.inner.lock();
        match inner.subscribers.get(endpoint) {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    pub fn written(&self) -> Vec<(String, Bytes)> {
        self.inner.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.inner.lock().written.clear();
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.fail_handshake {
            return Err(TransportError::Handshake("peripheral refused connection".into()));
        }
        inner.connected = true;
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<String>, TransportError> {
        if !self.inner.lock().connected {
            return Err(TransportError::Closed);
        }
        Ok(self.endpoints.clone())
    }

    async fn subscribe(&self, endpoint: &str) -> Result<NotificationRx, TransportError> {
        if !self.endpoints.iter().any(|e| e == endpoint) {
            return Err(TransportError::MissingEndpoint(endpoint.to_string()));
        }
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        inner.subscribers.insert(endpoint.to_string(), tx);
        Ok(rx)
    }

    fn write(&self, endpoint: &str, frame: Bytes) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::Closed);
        }
        if inner.fail_writes {
            return Err(TransportError::Msg("write rejected".into()));
        }
        inner.written.push((endpoint.to_string(), frame));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.fail_disconnect {
            return Err(TransportError::Msg("link supervision timeout".into()));
        }
        inner.connected = false;
        inner.subscribers.clear();
        Ok(())
    }
}
