//! Connection management.
//!
//! A [`ConnectionManager`] owns at most one live broker connection and one
//! channel on it. Both are created lazily on the first [`acquire`] and
//! recreated transparently once the broker reports either of them closed.
//! Every new channel re-declares the topology before it is handed out.
//!
//! [`acquire`]: ConnectionManager::acquire

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::broker::amqp::AmqpConnector;
use crate::broker::{BrokerChannel, BrokerConnection, BrokerError, ChannelOf, Connector, Topology};
use crate::config::Settings;

struct Handle<C: Connector> {
    connection: Option<Arc<C::Connection>>,
    channel: Option<Arc<ChannelOf<C>>>,
}

impl<C: Connector> Default for Handle<C> {
    fn default() -> Self {
        Self {
            connection: None,
            channel: None,
        }
    }
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    topology: Topology,
    /// Guards creation and teardown of the cached connection/channel.
    handle: Mutex<Handle<C>>,
    /// Publishes on the shared channel go one at a time.
    publish_lock: Mutex<()>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, topology: Topology) -> Self {
        Self {
            connector,
            topology,
            handle: Mutex::new(Handle::default()),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the cached connection and channel, creating whichever is missing or closed.
    ///
    /// A new connection always gets a new channel, and a new channel always
    /// re-declares the topology. Connection failures are returned as-is; retry
    /// policy belongs to the caller.
    pub async fn acquire(
        &self,
    ) -> Result<(Arc<C::Connection>, Arc<ChannelOf<C>>), BrokerError> {
        let mut handle = self.handle.lock().await;

        let reusable = handle
            .connection
            .as_ref()
            .filter(|c| c.is_open())
            .cloned();
        let connection = match reusable {
            Some(connection) => connection,
            None => {
                if handle.connection.is_some() {
                    warn!("cached broker connection is closed, reconnecting");
                }
                let connection = self.connector.connect().await.map_err(|e| {
                    error!(broker = %self.connector.describe(), "failed to create broker connection: {e}");
                    e
                })?;
                info!(broker = %self.connector.describe(), "created new broker connection");
                let connection = Arc::new(connection);
                handle.connection = Some(Arc::clone(&connection));
                handle.channel = None;
                connection
            }
        };

        let reusable = handle.channel.as_ref().filter(|c| c.is_open()).cloned();
        let channel = match reusable {
            Some(channel) => channel,
            None => {
                let channel = self.open_channel(&connection).await.map_err(|e| {
                    error!("failed to create broker channel: {e}");
                    e
                })?;
                info!("created new broker channel");
                let channel = Arc::new(channel);
                handle.channel = Some(Arc::clone(&channel));
                channel
            }
        };

        Ok((connection, channel))
    }

    async fn open_channel(&self, connection: &C::Connection) -> Result<ChannelOf<C>, BrokerError> {
        let channel = connection.open_channel().await?;
        self.topology.declare(&channel).await?;
        Ok(channel)
    }

    /// Forgets the cached connection and channel so the next [`acquire`](Self::acquire)
    /// starts from scratch.
    pub async fn invalidate(&self) {
        let mut handle = self.handle.lock().await;
        handle.channel = None;
        if handle.connection.take().is_some() {
            warn!("discarded cached broker connection");
        }
    }

    /// Serializes publishes on the shared channel; hold the guard for the duration of one publish.
    pub async fn publish_guard(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        let handle = self.handle.lock().await;
        handle.connection.as_ref().is_some_and(|c| c.is_open())
    }

    /// Closes the channel, then the connection. Idempotent and never fails:
    /// problems are logged and swallowed.
    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;

        if let Some(channel) = handle.channel.take() {
            if channel.is_open() {
                match channel.close().await {
                    Ok(()) => info!("broker channel closed"),
                    Err(e) => warn!("error while closing broker channel: {e}"),
                }
            }
        }

        if let Some(connection) = handle.connection.take() {
            if connection.is_open() {
                match connection.close().await {
                    Ok(()) => info!("broker connection closed"),
                    Err(e) => warn!("error while closing broker connection: {e}"),
                }
            }
        }
    }

    /// Runs `work` and closes the manager afterwards, whatever `work` returned.
    pub async fn scope<F, Fut, T>(self: Arc<Self>, work: F) -> T
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = T>,
    {
        let out = work(Arc::clone(&self)).await;
        self.close().await;
        out
    }
}

impl ConnectionManager<AmqpConnector> {
    pub fn from_settings(settings: &Settings) -> Self {
        let connector = AmqpConnector::new(&settings.amqp.uri, &settings.amqp.connection_name);
        Self::new(connector, Topology::from(&settings.topology))
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        let handle = self.handle.get_mut();
        if handle.connection.as_ref().is_some_and(|c| c.is_open()) {
            warn!("connection manager dropped while still connected; call close() first");
        }
    }
}

static SHARED: OnceLock<Arc<ConnectionManager<AmqpConnector>>> = OnceLock::new();

/// The process-wide AMQP connection manager. The first caller's settings win.
pub fn shared(settings: &Settings) -> Arc<ConnectionManager<AmqpConnector>> {
    Arc::clone(SHARED.get_or_init(|| {
        info!("initialized shared broker connection manager");
        Arc::new(ConnectionManager::from_settings(settings))
    }))
}
