//! Push connection management
//!
//! [`HubConnection`] owns the connection to the hub: the lifecycle state, the
//! reader task that dispatches server invocations, keep-alive, and the
//! reconnection task that runs after an established connection drops.
//!
//! Every connection session is identified by a generation number. `start()`
//! and `stop()` bump it, and tasks only apply a state transition or install a
//! transport while their generation is still current, so a late result from
//! an abandoned attempt can never resurrect a stopped connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AccessToken, TokenProvider};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::events::ConnectionState;
use crate::io::{
    FrameReader, FrameWriter, ReqwestHttpClient, TransportFactory, TransportPair,
    WebSocketTransportFactory,
};
use crate::protocol::{
    parse_frame, parse_handshake, CloseMessage, HandshakeRequest, HubMessage, RECORD_SEPARATOR,
};

const JOIN_GROUP: &str = "JoinGroup";
const LEAVE_GROUP: &str = "LeaveGroup";

/// Capacity of the state transition broadcast channel
const STATE_CHANNEL_CAPACITY: usize = 64;

type HandlerMap = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<Value>>)>>;

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Lifecycle {
    generation: u64,
    state: ConnectionState,
}

/// Why a reader task stopped reading
#[derive(Debug)]
enum ReadEnd {
    /// The server sent a hub Close message
    Closed(CloseMessage),
    /// Transport closed, failed or went silent
    Dropped(HubError),
}

/// State shared between the connection handle, the reader task and the
/// reconnection task
pub(crate) struct SharedConnection {
    config: HubConfig,
    hub_url: String,
    token_provider: TokenProvider,
    factory: Arc<dyn TransportFactory>,
    lifecycle: StdMutex<Lifecycle>,
    state_watch: watch::Sender<ConnectionState>,
    state_events: broadcast::Sender<ConnectionState>,
    writer: Mutex<Option<Box<dyn FrameWriter>>>,
    reader_handle: StdMutex<Option<JoinHandle<()>>>,
    reconnect_handle: StdMutex<Option<JoinHandle<()>>>,
    handlers: Arc<StdMutex<HandlerMap>>,
    next_handler_id: AtomicU64,
}

impl SharedConnection {
    fn state(&self) -> ConnectionState {
        lock(&self.lifecycle).state
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.lifecycle).generation == generation
    }

    fn publish(&self, state: ConnectionState) {
        debug!("Connection state -> {}", state);
        self.state_watch.send_replace(state);
        let _ = self.state_events.send(state);
    }

    /// Move to `to` if `generation` is still current
    ///
    /// Publishes even when the state is unchanged, so every reconnection
    /// attempt is visible to observers.
    fn transition(&self, generation: u64, to: ConnectionState) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.generation != generation {
            debug!(
                "Ignoring transition to {} from stale generation {}",
                to, generation
            );
            return false;
        }
        lifecycle.state = to;
        self.publish(to);
        true
    }

    /// Open a transport with `token` and complete the hub handshake
    ///
    /// Returns the transport and any records that arrived together with the
    /// handshake response. Token acquisition is not part of this call, so an
    /// interactive sign-in is never cut short by the connection timeout.
    async fn open(&self, token: &AccessToken) -> Result<(TransportPair, String)> {
        let mut pair = self.factory.connect(&self.hub_url, token).await?;

        match handshake(&mut pair).await {
            Ok(rest) => Ok((pair, rest)),
            Err(e) => {
                let _ = pair.writer.shutdown().await;
                Err(e)
            }
        }
    }

    /// Install a freshly opened transport for `generation`
    ///
    /// Returns false (and closes the transport) when the generation went stale
    /// while the transport was being opened.
    async fn install(
        self: &Arc<Self>,
        generation: u64,
        pair: TransportPair,
        leftover: String,
    ) -> bool {
        let TransportPair { reader, mut writer } = pair;
        let mut writer_guard = self.writer.lock().await;

        if !self.is_current(generation) {
            debug!("Discarding transport opened for stale generation {}", generation);
            drop(writer_guard);
            let _ = writer.shutdown().await;
            return false;
        }

        *writer_guard = Some(writer);
        let handle = spawn_reader_task(self.clone(), generation, reader, leftover);
        if let Some(previous) = lock(&self.reader_handle).replace(handle) {
            previous.abort();
        }
        self.transition(generation, ConnectionState::Connected)
    }

    /// Write one record if a transport is installed
    async fn write_record(&self, record: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_frame(record).await,
            None => {
                debug!("No transport installed, dropping outbound record");
                Ok(())
            }
        }
    }

    async fn close_writer(&self, send_close: bool) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if send_close {
                if let Ok(record) = HubMessage::Close(CloseMessage::default()).to_record() {
                    let _ = writer.write_frame(&record).await;
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!("Error closing transport: {}", e);
            }
        }
    }

    /// Handle every record in a frame; returns the Close message if one arrived
    fn dispatch_frame(&self, frame: &str) -> Option<CloseMessage> {
        for message in parse_frame(frame) {
            match message {
                Ok(HubMessage::Invocation(invocation)) => {
                    self.dispatch_invocation(&invocation.target, invocation.arguments)
                }
                Ok(HubMessage::Ping) => debug!("Received ping"),
                Ok(HubMessage::Completion(completion)) => {
                    debug!("Ignoring completion for {}", completion.invocation_id)
                }
                Ok(HubMessage::Close(close)) => return Some(close),
                Ok(HubMessage::Other(message_type)) => {
                    debug!("Ignoring hub message of type {}", message_type)
                }
                Err(e) => warn!("Ignoring malformed hub record: {}", e),
            }
        }
        None
    }

    fn dispatch_invocation(&self, target: &str, arguments: Vec<Value>) {
        let mut handlers = lock(&self.handlers);
        match handlers.get_mut(&target.to_lowercase()) {
            Some(subscribers) => {
                debug!("Dispatching {} to {} subscriber(s)", target, subscribers.len());
                subscribers.retain(|(_, sender)| sender.send(arguments.clone()).is_ok());
            }
            None => debug!("No subscriber for invocation {}", target),
        }
    }
}

/// Send the handshake request and wait for the response
async fn handshake(pair: &mut TransportPair) -> Result<String> {
    pair.writer
        .write_frame(&HandshakeRequest::json().to_record()?)
        .await?;

    let mut buffer = String::new();
    while !buffer.contains(RECORD_SEPARATOR) {
        match pair.reader.read_frame().await? {
            Some(frame) => buffer.push_str(&frame),
            None => {
                return Err(HubError::Handshake(
                    "Connection closed during handshake".to_string(),
                ))
            }
        }
    }

    let (response, rest) = parse_handshake(&buffer)?;
    if let Some(error) = response.error {
        return Err(HubError::Handshake(error));
    }
    debug!("Hub handshake completed");
    Ok(rest.to_string())
}

/// Spawn a reader task for one established connection
fn spawn_reader_task(
    shared: Arc<SharedConnection>,
    generation: u64,
    mut reader: Box<dyn FrameReader>,
    leftover: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let keep_alive = shared.config.keep_alive_interval;
        let server_timeout = shared.config.server_timeout;
        let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_received = Instant::now();

        let mut end = None;
        if !leftover.is_empty() {
            end = shared.dispatch_frame(&leftover).map(ReadEnd::Closed);
        }

        let end = match end {
            Some(end) => end,
            None => loop {
                tokio::select! {
                    frame = reader.read_frame() => match frame {
                        Ok(Some(frame)) => {
                            last_received = Instant::now();
                            debug!("Received frame: {}", frame);
                            if let Some(close) = shared.dispatch_frame(&frame) {
                                break ReadEnd::Closed(close);
                            }
                        }
                        Ok(None) => break ReadEnd::Dropped(HubError::TransportDrop(
                            "Connection closed by server".to_string(),
                        )),
                        Err(e) => break ReadEnd::Dropped(e),
                    },
                    _ = ping.tick() => {
                        match HubMessage::Ping.to_record() {
                            Ok(record) => {
                                if let Err(e) = shared.write_record(&record).await {
                                    break ReadEnd::Dropped(HubError::TransportDrop(format!(
                                        "Keep-alive failed: {}",
                                        e
                                    )));
                                }
                            }
                            Err(e) => warn!("Failed to encode keep-alive: {}", e),
                        }
                    }
                    _ = tokio::time::sleep_until(last_received + server_timeout) => {
                        break ReadEnd::Dropped(HubError::TransportDrop(format!(
                            "Nothing received from server for {:?}",
                            server_timeout
                        )));
                    }
                }
            },
        };

        if !shared.is_current(generation) {
            debug!("Reader for stale generation {} exiting", generation);
            return;
        }
        shared.close_writer(false).await;

        match end {
            ReadEnd::Closed(close) if !close.allows_reconnect() => {
                warn!(
                    "Hub closed the connection: {}",
                    close.error.as_deref().unwrap_or("no reason given")
                );
                shared.transition(generation, ConnectionState::Disconnected);
            }
            end => {
                let reason = match end {
                    ReadEnd::Closed(close) => close
                        .error
                        .unwrap_or_else(|| "Hub requested reconnect".to_string()),
                    ReadEnd::Dropped(e) => e.to_string(),
                };
                warn!("Hub connection lost: {}", reason);

                if shared.config.reconnect.enabled {
                    let task = spawn_reconnect_task(shared.clone(), generation);
                    if let Some(previous) = lock(&shared.reconnect_handle).replace(task) {
                        previous.abort();
                    }
                } else {
                    shared.transition(generation, ConnectionState::Disconnected);
                }
            }
        }
    })
}

/// Spawn the reconnection task for a dropped connection
fn spawn_reconnect_task(shared: Arc<SharedConnection>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reconnect = shared.config.reconnect.clone();
        let max_attempts = reconnect
            .max_attempts
            .map_or("unlimited".to_string(), |m| m.to_string());
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if !reconnect.allows_attempt(attempt) {
                warn!(
                    "Reconnection failed: max attempts ({}) exceeded",
                    max_attempts
                );
                shared.transition(generation, ConnectionState::Disconnected);
                return;
            }

            if !shared.transition(generation, ConnectionState::Reconnecting) {
                return;
            }

            let delay = reconnect.delay_for_attempt(attempt);
            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                shared.hub_url, delay, attempt, max_attempts
            );
            tokio::time::sleep(delay).await;

            if !shared.is_current(generation) {
                return;
            }

            let token = shared.token_provider.get_token().await;
            if !shared.is_current(generation) {
                return;
            }

            let timeout = shared.config.connection_timeout;
            match tokio::time::timeout(timeout, shared.open(&token)).await {
                Ok(Ok((pair, leftover))) => {
                    if shared.install(generation, pair, leftover).await {
                        info!("Reconnected to {}", shared.hub_url);
                    }
                    return;
                }
                Ok(Err(e)) => debug!("Reconnection attempt {} failed: {}", attempt, e),
                Err(_) => debug!(
                    "Reconnection attempt {} timed out after {:?}",
                    attempt, shared.config.connection_timeout
                ),
            }
        }
    })
}

/// Subscription to one server invocation target
///
/// Yields the arguments of every matching invocation. Dropping the stream
/// unsubscribes; the stream ends when the connection is stopped.
pub struct InvocationStream {
    target: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Vec<Value>>,
    handlers: Weak<StdMutex<HandlerMap>>,
}

impl InvocationStream {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Next invocation's arguments, or `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Vec<Value>> {
        self.receiver.recv().await
    }
}

impl Drop for InvocationStream {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            let mut handlers = lock(&handlers);
            let key = self.target.to_lowercase();
            if let Some(subscribers) = handlers.get_mut(&key) {
                subscribers.retain(|(id, _)| *id != self.id);
                if subscribers.is_empty() {
                    handlers.remove(&key);
                }
            }
        }
    }
}

impl std::fmt::Debug for InvocationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationStream")
            .field("target", &self.target)
            .field("id", &self.id)
            .finish()
    }
}

/// Reconnecting client for a SignalR hub
#[derive(Clone)]
pub struct HubConnection {
    shared: Arc<SharedConnection>,
}

impl HubConnection {
    /// Create a connection using WebSockets and reqwest
    pub fn new(config: HubConfig, token_provider: TokenProvider) -> Self {
        let factory = Arc::new(WebSocketTransportFactory::new(
            Arc::new(ReqwestHttpClient::default()),
            config.skip_negotiation,
        ));
        Self::with_transport_factory(config, token_provider, factory)
    }

    /// Create a connection with a custom transport factory
    ///
    /// This is useful for testing with mock transports.
    pub fn with_transport_factory(
        config: HubConfig,
        token_provider: TokenProvider,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (state_watch, _) = watch::channel(ConnectionState::Disconnected);
        let (state_events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(SharedConnection {
                hub_url: config.hub_url(),
                config,
                token_provider,
                factory,
                lifecycle: StdMutex::new(Lifecycle::default()),
                state_watch,
                state_events,
                writer: Mutex::new(None),
                reader_handle: StdMutex::new(None),
                reconnect_handle: StdMutex::new(None),
                handlers: Arc::new(StdMutex::new(HashMap::new())),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn hub_url(&self) -> &str {
        &self.shared.hub_url
    }

    /// Connect to the hub
    ///
    /// Only valid while disconnected. The first connection attempt is not
    /// retried: failures are returned and the state goes back to
    /// Disconnected.
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if lifecycle.state != ConnectionState::Disconnected {
                return Err(HubError::InvalidState(format!(
                    "Cannot start while {}",
                    lifecycle.state
                )));
            }
            lifecycle.generation += 1;
            lifecycle.state = ConnectionState::Connecting;
            self.shared.publish(ConnectionState::Connecting);
            lifecycle.generation
        };

        info!("Connecting to {}", self.shared.hub_url);
        let token = self.shared.token_provider.get_token().await;
        if !self.shared.is_current(generation) {
            debug!("Connection attempt superseded by stop() during sign-in");
            return Err(HubError::Cancelled);
        }

        let timeout = self.shared.config.connection_timeout;
        let opened = match tokio::time::timeout(timeout, self.shared.open(&token)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout(format!(
                "Connecting to {} took longer than {:?}",
                self.shared.hub_url, timeout
            ))),
        };

        match opened {
            Ok((pair, leftover)) => {
                if self.shared.install(generation, pair, leftover).await {
                    info!("Connected to {}", self.shared.hub_url);
                    Ok(())
                } else {
                    debug!("Connection attempt superseded by stop()");
                    Err(HubError::Cancelled)
                }
            }
            Err(e) => {
                if self
                    .shared
                    .transition(generation, ConnectionState::Disconnected)
                {
                    warn!("Failed to connect to {}: {}", self.shared.hub_url, e);
                    Err(e)
                } else {
                    Err(HubError::Cancelled)
                }
            }
        }
    }

    /// Disconnect and stop any reconnection
    ///
    /// Valid in every state and idempotent. Closes all invocation streams.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            lifecycle.generation += 1;
            let previous = lifecycle.state;
            lifecycle.state = ConnectionState::Disconnected;
            if previous != ConnectionState::Disconnected {
                self.shared.publish(ConnectionState::Disconnected);
            }
            previous
        };

        if previous != ConnectionState::Disconnected {
            info!("Stopping connection to {}", self.shared.hub_url);
        }

        if let Some(handle) = lock(&self.shared.reconnect_handle).take() {
            handle.abort();
        }
        self.shared
            .close_writer(previous == ConnectionState::Connected)
            .await;
        if let Some(handle) = lock(&self.shared.reader_handle).take() {
            handle.abort();
        }
        lock(&self.shared.handlers).clear();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver holding the latest state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_watch.subscribe()
    }

    /// Receiver for every state transition, in order
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_events.subscribe()
    }

    /// Subscribe to invocations of `target` (matched case-insensitively)
    pub fn on(&self, target: &str) -> InvocationStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.handlers)
            .entry(target.to_lowercase())
            .or_default()
            .push((id, sender));
        debug!("Subscribed to {}", target);

        InvocationStream {
            target: target.to_string(),
            id,
            receiver,
            handlers: Arc::downgrade(&self.shared.handlers),
        }
    }

    /// Invoke a hub method without waiting for a result
    ///
    /// Does nothing unless connected.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        if !self.state().can_send() {
            debug!("Not connected, skipping invocation of {}", target);
            return Ok(());
        }
        let record = HubMessage::send(target, arguments).to_record()?;
        self.shared.write_record(&record).await
    }

    pub async fn join_group(&self, group: &str) -> Result<()> {
        debug!("Joining group {}", group);
        self.send(JOIN_GROUP, vec![Value::from(group)]).await
    }

    pub async fn leave_group(&self, group: &str) -> Result<()> {
        debug!("Leaving group {}", group);
        self.send(LEAVE_GROUP, vec![Value::from(group)]).await
    }
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("hub_url", &self.shared.hub_url)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait until `receiver` reports `target` or `timeout` elapses
pub async fn wait_for_state(
    receiver: &mut watch::Receiver<ConnectionState>,
    target: ConnectionState,
    timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(timeout, receiver.wait_for(|state| *state == target))
        .await
        .map_err(|_| HubError::Timeout(format!("State did not become {}", target)))?
        .map_err(|_| HubError::InvalidState("Connection dropped".to_string()))?;
    Ok(())
}
