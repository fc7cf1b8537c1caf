//! Named broker connections with exponential... actually fixed-interval,
//! capped auto-reconnect; emits a recover signal per connection name.
//!
//! Replaces the historical process-wide mutable connection map with a
//! `ConnectionManager` struct owned by the `Broker`. No module-level
//! singletons: every caller holds an explicit handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lapin::{Connection, ConnectionProperties};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::error::DialError;
use messageman_metrics::{Exporter, ServiceLabels};

pub const DEFAULT_CONNECTION_NAME: &str = "default";
const RECONNECT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Reconnecting,
    Closed,
}

/// A named, supervised broker connection. Cheaply cloneable: the
/// underlying `lapin::Connection` is itself a cheap handle, and the state
/// is shared through an `Arc<Mutex<_>>` so the reconnect task and callers
/// observe the same value.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub name: String,
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    connection: Connection,
    state: ConnectionState,
}

impl ConnectionHandle {
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn create_channel(&self) -> Result<lapin::Channel, DialError> {
        let inner = self.inner.lock().await;
        inner.connection.create_channel().await.map_err(DialError::Channel)
    }
}

/// Owns the named-connection registry and the shutdown/recover signalling
/// the Broker hands to the Registrar.
pub struct ConnectionManager {
    url: String,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    exporter: Arc<dyn Exporter>,
    recover_tx: broadcast::Sender<String>,
    shutdown: Arc<Notify>,
}

impl ConnectionManager {
    pub fn new(url: String, exporter: Arc<dyn Exporter>) -> Self {
        let (recover_tx, _rx) = broadcast::channel(64);
        Self {
            url,
            connections: Mutex::new(HashMap::new()),
            exporter,
            recover_tx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Subscribes to the per-connection-name recover broadcast. A lagged
    /// receiver (slow Registrar) should treat `RecvError::Lagged` as a
    /// signal to resync every registered consumer, not a fatal error.
    pub fn subscribe_recover(&self) -> broadcast::Receiver<String> {
        self.recover_tx.subscribe()
    }

    /// Opens a transient connection, closes it, and reports whether
    /// dial + close succeeded. Holds no state; used by `Broker::ensure_can_connect`.
    pub async fn probe(&self) -> bool {
        match Connection::connect(&self.url, ConnectionProperties::default()).await {
            Ok(conn) => conn.close(200, "probe").await.is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "failed to connect to the broker");
                false
            }
        }
    }

    /// Returns the existing handle for `name`, or dials and registers a
    /// new one. `name = ""` maps to `"default"`. The initial dial failure
    /// is returned to the caller; subsequent disconnects are handled by a
    /// background supervisor that retries every 5s and emits a recover
    /// signal on success.
    pub async fn connection(self: &Arc<Self>, name: &str) -> Result<ConnectionHandle, DialError> {
        let name = if name.is_empty() { DEFAULT_CONNECTION_NAME } else { name };

        {
            let connections = self.connections.lock().await;
            if let Some(handle) = connections.get(name) {
                return Ok(handle.clone());
            }
        }

        let conn = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(DialError::Connect)?;

        let handle = ConnectionHandle {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(Inner { connection: conn, state: ConnectionState::Open })),
        };

        {
            let mut connections = self.connections.lock().await;
            connections.insert(name.to_string(), handle.clone());
        }
        self.exporter.inc_connection(ServiceLabels { service: name });

        self.spawn_supervisor(name.to_string(), handle.clone());

        Ok(handle)
    }

    fn spawn_supervisor(self: &Arc<Self>, name: String, handle: ConnectionHandle) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (err_tx, mut err_rx) = tokio::sync::mpsc::channel(1);
                {
                    let inner = handle.inner.lock().await;
                    let tx = err_tx.clone();
                    inner.connection.on_error(move |err| {
                        let _ = tx.try_send(err);
                    });
                }

                tokio::select! {
                    _ = err_rx.recv() => {}
                    _ = manager.shutdown.notified() => {
                        tracing::info!(name = %name, "connection supervisor shutting down");
                        return;
                    }
                }

                {
                    let mut inner = handle.inner.lock().await;
                    inner.state = ConnectionState::Reconnecting;
                }
                manager.exporter.dec_connection(ServiceLabels { service: &name });
                tracing::error!(name = %name, "connection closed unexpectedly, reconnecting");

                loop {
                    tokio::time::sleep(RECONNECT_WAIT).await;
                    match Connection::connect(&manager.url, ConnectionProperties::default()).await {
                        Ok(new_conn) => {
                            let mut inner = handle.inner.lock().await;
                            inner.connection = new_conn;
                            inner.state = ConnectionState::Open;
                            drop(inner);
                            manager.exporter.inc_connection(ServiceLabels { service: &name });
                            tracing::info!(name = %name, "successfully reconnected");
                            let _ = manager.recover_tx.send(name.clone());
                            break;
                        }
                        Err(e) => {
                            manager.exporter.inc_error(ServiceLabels { service: &name });
                            tracing::error!(name = %name, error = %e, "failed to reconnect");
                        }
                    }
                }
            }
        });
    }

    /// Signals every connection supervisor to stop. Connections themselves
    /// are dropped (and thus closed) when their last handle goes away.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_connection_name_is_stable() {
        assert_eq!(DEFAULT_CONNECTION_NAME, "default");
    }
}
