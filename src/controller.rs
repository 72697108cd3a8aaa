//! Session controller for a Folding@home client
//!
//! This module provides the public client: it owns the current connection,
//! drives the read loop, keeps the subscription set, reconnects after lost
//! connections and fans decoded frames out to registered callbacks.

mod callbacks;

use crate::protocol::{CommandTable, Frame, PowerLevel};
use crate::transport::{
    Connection, ControlError, DEFAULT_PORT, PYON_ERROR, Result, UNAUTHENTICATED_UPDATES_ERROR,
    assemble_frame, is_frame_header,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use callbacks::{Callback, CallbackToken, async_callback, sync_callback};

use callbacks::CallbackRegistry;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Seconds between two reports of the same subscription
pub const DEFAULT_UPDATE_RATE: u64 = 5;

/// Upper bound for one connect attempt (socket, banner and auth)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between two failed connect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Reports subscribed to by `start`
pub const DEFAULT_REPORTS: [&str; 3] = ["options", "queue-info", "slot-info"];

/// Configuration of a controller
#[derive(Clone)]
pub struct ControllerConfig {
    pub address: String,
    pub port: u16,
    pub password: Option<String>,
    pub read_timeout: Duration,
    pub update_rate: u64,
    pub reconnect_enabled: bool,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reports: Vec<String>,
    pub commands: CommandTable,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_PORT,
            password: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            update_rate: DEFAULT_UPDATE_RATE,
            reconnect_enabled: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reports: DEFAULT_REPORTS.iter().map(|r| r.to_string()).collect(),
            commands: CommandTable::default(),
        }
    }
}

// Hand-written so the password never ends up in logs
impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("read_timeout", &self.read_timeout)
            .field("update_rate", &self.update_rate)
            .field("reconnect_enabled", &self.reconnect_enabled)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("reports", &self.reports)
            .finish_non_exhaustive()
    }
}

impl ControllerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_update_rate(mut self, update_rate: u64) -> Self {
        self.update_rate = update_rate;
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn with_reports<S: Into<String>>(mut self, reports: impl IntoIterator<Item = S>) -> Self {
        self.reports = reports.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }
}

/// One standing report request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u32,
    pub interval: u64,
    pub report: String,
}

/// Active subscriptions; ids count up from 0 until the set is cleared
#[derive(Debug, Default)]
struct SubscriptionSet {
    next_id: u32,
    active: Vec<Subscription>,
}

impl SubscriptionSet {
    fn add(&mut self, report: &str, interval: u64) -> Subscription {
        let subscription = Subscription {
            id: self.next_id,
            interval,
            report: report.to_string(),
        };
        self.next_id += 1;
        self.active.push(subscription.clone());
        subscription
    }

    /// Drop every subscription and return the report names that were active
    fn clear(&mut self) -> Vec<String> {
        self.next_id = 0;
        self.active.drain(..).map(|s| s.report).collect()
    }

    fn reports(&self) -> Vec<String> {
        self.active.iter().map(|s| s.report.clone()).collect()
    }
}

/// Client for one command server.
///
/// Cloning is cheap and every clone drives the same session, so commands can
/// be issued from other tasks while `start` is running.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    read_timeout: Mutex<Duration>,
    update_rate: Mutex<u64>,
    connection: Mutex<Option<Arc<Connection>>>,
    subscriptions: Mutex<SubscriptionSet>,
    callbacks: CallbackRegistry,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.inner.config)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let inner = ControllerInner {
            read_timeout: Mutex::new(config.read_timeout),
            update_rate: Mutex::new(config.update_rate),
            connection: Mutex::new(None),
            subscriptions: Mutex::new(SubscriptionSet::default()),
            callbacks: CallbackRegistry::default(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    pub fn is_connected(&self) -> bool {
        self.current_connection()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_connection()
            .map(|c| c.is_authenticated())
            .unwrap_or(false)
    }

    pub fn read_timeout(&self) -> Duration {
        self.inner
            .read_timeout
            .lock()
            .map(|t| *t)
            .unwrap_or(DEFAULT_READ_TIMEOUT)
    }

    /// Change the read timeout of the current and all later connections
    pub fn set_read_timeout(&self, timeout: Duration) {
        if let Ok(mut current) = self.inner.read_timeout.lock() {
            *current = timeout;
        }
        if let Some(connection) = self.current_connection() {
            connection.set_read_timeout(timeout);
        }
    }

    pub fn update_rate(&self) -> u64 {
        self.inner
            .update_rate
            .lock()
            .map(|r| *r)
            .unwrap_or(DEFAULT_UPDATE_RATE)
    }

    /// Currently active subscriptions, in subscription order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscription_set().active.clone()
    }

    // The set stays consistent across a panicking holder, so a poisoned lock is recovered
    fn subscription_set(&self) -> MutexGuard<'_, SubscriptionSet> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a frame handler; it survives reconnects until removed
    pub fn register_callback(&self, callback: Arc<dyn Callback>) -> CallbackToken {
        let token = self.inner.callbacks.register(callback);
        debug!(?token, "Registered callback");
        token
    }

    pub fn remove_callback(&self, token: CallbackToken) -> bool {
        self.inner.callbacks.remove(token)
    }

    /// Set the hook run after a lost connection; replaces any previous hook
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.set_disconnect_hook(Arc::new(hook));
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.lock().ok().and_then(|c| c.clone())
    }

    fn replace_connection(&self, connection: Option<Arc<Connection>>) -> Option<Arc<Connection>> {
        self.inner
            .connection
            .lock()
            .ok()
            .and_then(|mut current| std::mem::replace(&mut *current, connection))
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.current_connection()
            .filter(|c| c.is_connected())
            .ok_or(ControlError::NotConnected)
    }

    /// Make a single connect attempt bounded by `timeout`
    pub async fn try_connect(&self, timeout: Duration) -> Result<()> {
        let config = &self.inner.config;
        if let Some(previous) = self.replace_connection(None) {
            previous.cleanup().await;
        }

        let connection = Arc::new(Connection::new(
            config.address.clone(),
            config.port,
            config.password.clone(),
            self.read_timeout(),
        ));

        match tokio::time::timeout(timeout, connection.connect()).await {
            Ok(Ok(())) => {
                self.replace_connection(Some(connection));
                Ok(())
            }
            Ok(Err(e @ ControlError::AuthenticationFailed(_))) => Err(e),
            Ok(Err(e @ ControlError::ConnectionFailed(_))) => Err(e),
            Ok(Err(e)) => Err(ControlError::ConnectionFailed(e.to_string())),
            Err(_) => {
                connection.cleanup().await;
                Err(ControlError::ConnectionFailed(format!(
                    "Connecting to {}:{} timed out after {:.1}s",
                    config.address,
                    config.port,
                    timeout.as_secs_f32()
                )))
            }
        }
    }

    /// Connect, retrying forever on connection failures.
    ///
    /// Authentication failures are returned immediately.
    pub async fn connect(&self) -> Result<()> {
        let config = &self.inner.config;
        loop {
            match self.try_connect(config.connect_timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_failure() => {
                    warn!(
                        address = %config.address,
                        port = config.port,
                        error = %e,
                        "Connection attempt failed, retrying in {:.1}s",
                        config.reconnect_delay.as_secs_f32()
                    );
                    tokio::time::sleep(config.reconnect_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Subscribe to the given reports at the current update rate, in one write
    pub async fn subscribe<S: AsRef<str>>(&self, reports: &[S]) -> Result<()> {
        let connection = self.connection()?;
        if reports.is_empty() {
            return Ok(());
        }

        let interval = self.update_rate();
        let commands = &self.inner.config.commands;
        let package: String = {
            let mut subscriptions = self.subscription_set();
            reports
                .iter()
                .map(|report| {
                    let subscription = subscriptions.add(report.as_ref(), interval);
                    commands.subscribe(subscription.id, subscription.interval, &subscription.report)
                })
                .collect()
        };

        debug!(commands = package.trim_end(), "Subscribing");
        connection.send(&package).await
    }

    /// Clear all subscriptions; ids start again at 0
    pub async fn unsubscribe_all(&self) -> Result<()> {
        let connection = self.connection()?;
        connection
            .send(&self.inner.config.commands.unsubscribe_all())
            .await?;
        self.subscription_set().clear();
        Ok(())
    }

    /// Change the update interval, re-issuing active subscriptions under the new rate
    pub async fn set_update_rate(&self, rate: u64) -> Result<()> {
        if let Ok(mut current) = self.inner.update_rate.lock() {
            *current = rate;
        }

        let reports = self.subscription_set().reports();
        if reports.is_empty() {
            return Ok(());
        }

        self.unsubscribe_all().await?;
        self.subscribe(&reports).await
    }

    async fn send_command(&self, command: String) -> Result<()> {
        let connection = self.connection()?;
        debug!(command = command.trim_end(), "Sending command");
        connection.send(&command).await
    }

    /// Pause all slots, or one slot
    pub async fn pause(&self, slot: Option<u32>) -> Result<()> {
        self.send_command(self.inner.config.commands.pause(slot)).await
    }

    /// Unpause all slots, or one slot
    pub async fn unpause(&self, slot: Option<u32>) -> Result<()> {
        self.send_command(self.inner.config.commands.unpause(slot)).await
    }

    pub async fn request_work_server_assignment(&self) -> Result<()> {
        self.send_command(self.inner.config.commands.request_work_server())
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(self.inner.config.commands.shutdown()).await
    }

    pub async fn set_power_level(&self, level: PowerLevel) -> Result<()> {
        self.send_command(self.inner.config.commands.set_power_level(level))
            .await
    }

    /// Connect, subscribe to the configured reports and run the read loop
    pub async fn start(&self) -> Result<()> {
        self.start_with(true, true).await
    }

    /// Run the read loop, optionally connecting and subscribing first.
    ///
    /// Returns `Ok(())` once the connection is lost with reconnection
    /// disabled. Authentication and decoding errors end the session.
    pub async fn start_with(&self, connect: bool, subscribe: bool) -> Result<()> {
        if connect {
            self.connect().await?;
        }
        let restore = if subscribe {
            self.inner.config.reports.clone()
        } else {
            Vec::new()
        };
        self.read_loop(restore).await
    }

    /// Like `start`, until `cancel` fires. Cancellation closes the connection
    /// and returns `ControlError::Cancelled`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(address = %self.address(), port = self.port(), "Session cancelled");
                self.cleanup().await;
                Err(ControlError::Cancelled)
            }
            result = self.start() => result,
        }
    }

    /// Close the current connection and forget active subscriptions
    pub async fn cleanup(&self) {
        if let Some(connection) = self.replace_connection(None) {
            connection.cleanup().await;
        }
        self.subscription_set().clear();
    }

    async fn read_loop(&self, mut restore: Vec<String>) -> Result<()> {
        let reconnect_enabled = self.inner.config.reconnect_enabled;
        loop {
            let Some(connection) = self.current_connection() else {
                if !reconnect_enabled {
                    return Ok(());
                }
                self.connect().await?;
                continue;
            };

            let result = if restore.is_empty() {
                self.process_next_line(&connection).await
            } else {
                match self.subscribe(&restore).await {
                    Ok(()) => {
                        restore.clear();
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_connection_failure() || matches!(e, ControlError::NotConnected) => {
                    let lost = self.handle_disconnect(&connection, &e).await;
                    if !lost.is_empty() {
                        restore = lost;
                    }
                    if !reconnect_enabled {
                        return Ok(());
                    }
                    self.connect().await?;
                }
                Err(e) => {
                    self.cleanup().await;
                    return Err(e);
                }
            }
        }
    }

    async fn handle_disconnect(&self, connection: &Connection, cause: &ControlError) -> Vec<String> {
        warn!(
            address = %self.address(),
            port = self.port(),
            error = %cause,
            "Lost connection to command server"
        );
        connection.cleanup().await;
        let lost = self.subscription_set().clear();
        self.inner.callbacks.notify_disconnect();
        lost
    }

    async fn process_next_line(&self, connection: &Connection) -> Result<()> {
        let line = connection.read().await?;

        if is_frame_header(&line) {
            let frame = assemble_frame(&line, move || connection.read()).await?;
            debug!(message_type = %frame.message_type, "Received frame");
            self.inner.callbacks.dispatch(frame).await;
        } else if line.contains(PYON_ERROR) {
            error!(line = line.trim_end(), "Command server reported an error");
            if line.contains(UNAUTHENTICATED_UPDATES_ERROR) && !connection.is_authenticated() {
                return Err(ControlError::AuthenticationRequired(
                    "The command server requires a password".to_string(),
                ));
            }
            self.inner.callbacks.dispatch(Frame::new_error(&line)).await;
        }
        Ok(())
    }
}
