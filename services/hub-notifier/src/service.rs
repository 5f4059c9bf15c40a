//! Notification hub service
//!
//! Wires the push connection to the normalizer and the store: every
//! invocation of a configured notification target is normalized and
//! prepended to the feed, and configured groups are re-joined each time the
//! connection becomes Connected.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::config::HubConfig;
use crate::connection::HubConnection;
use crate::error::{HubError, Result};
use crate::events::ConnectionState;
use crate::io::TransportFactory;
use crate::notification::{normalize, payload_from_arguments, Notification};
use crate::store::NotificationStore;

pub struct NotificationHub {
    config: HubConfig,
    connection: HubConnection,
    store: Arc<NotificationStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationHub {
    pub fn new(config: HubConfig, token_provider: TokenProvider) -> Self {
        let connection = HubConnection::new(config.clone(), token_provider);
        Self::from_connection(config, connection)
    }

    /// Create a hub over a custom transport factory
    pub fn with_transport(
        config: HubConfig,
        token_provider: TokenProvider,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let connection =
            HubConnection::with_transport_factory(config.clone(), token_provider, factory);
        Self::from_connection(config, connection)
    }

    fn from_connection(config: HubConfig, connection: HubConnection) -> Self {
        Self {
            config,
            connection,
            store: Arc::new(NotificationStore::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the notification targets and connect
    ///
    /// On failure every task started here is torn down and the connection
    /// error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(HubError::InvalidState(
                "Notification hub already started".to_string(),
            ));
        }

        for target in &self.config.notification_targets {
            tasks.push(self.spawn_forwarder(target));
        }
        if !self.config.groups.is_empty() {
            tasks.push(self.spawn_group_sync());
        }

        if let Err(e) = self.connection.start().await {
            for task in tasks.drain(..) {
                task.abort();
            }
            self.connection.stop().await;
            return Err(e);
        }

        info!(
            "Listening for {} on {}",
            self.config.notification_targets.join(", "),
            self.connection.hub_url()
        );
        Ok(())
    }

    /// Disconnect and stop forwarding; safe to call repeatedly
    pub async fn stop(&self) {
        self.connection.stop().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn connection(&self) -> &HubConnection {
        &self.connection
    }

    /// Add a notification that did not come from the push channel
    pub fn add_notification(&self, notification: Notification) -> bool {
        self.store.ingest(notification)
    }

    fn spawn_forwarder(&self, target: &str) -> JoinHandle<()> {
        let mut stream = self.connection.on(target);
        let store = self.store.clone();
        tokio::spawn(async move {
            while let Some(arguments) = stream.recv().await {
                let notification = normalize(payload_from_arguments(arguments), stream.target());
                info!(
                    "Received {} notification {}",
                    notification.kind, notification.id
                );
                store.ingest(notification);
            }
            debug!("Subscription to {} closed", stream.target());
        })
    }

    fn spawn_group_sync(&self) -> JoinHandle<()> {
        let mut states = self.connection.subscribe_state();
        let connection = self.connection.clone();
        let groups = self.config.groups.clone();
        tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(ConnectionState::Connected) => join_groups(&connection, &groups).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Group sync skipped {} state changes", skipped);
                        if connection.state() == ConnectionState::Connected {
                            join_groups(&connection, &groups).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn join_groups(connection: &HubConnection, groups: &[String]) {
    for group in groups {
        if let Err(e) = connection.join_group(group).await {
            warn!("Failed to join group {}: {}", group, e);
        }
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("connection", &self.connection)
            .field("notifications", &self.store.len())
            .finish()
    }
}
