//! VPN engine implementation
//!
//! The engine owns one [`SessionProxy`] and drives it from a single task.
//! Socket reads, tunnel packets, timer ticks and shutdown requests are all
//! multiplexed with `tokio::select!`, so the session is never entered
//! concurrently.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Instant as TokioInstant, MissedTickBehavior};

use ovpn_protocol::{
    Credentials, EncryptionParameters, Link, RustlsFactory, SessionEvent, SessionOptions,
    SessionProxy, TlsFactory, Tunnel,
};

use crate::config::{ClientConfig, Config, Proto};
use crate::error::{Error, Result};
use crate::event::{EventHandler, LogLevel, LoggingEventHandler, VpnEvent, VpnState, VpnStats};
use crate::socket::{LinkEvent, LinkOptions, TcpLink, UdpLink};
use crate::tunnel::{ChannelTunnel, TunnelHandle};

/// Tunnel packets handed to the session per wakeup
const TUNNEL_BATCH: usize = 64;

/// Internal engine state
struct EngineState {
    state: VpnState,
    stats: VpnStats,
    connected_at: Option<std::time::Instant>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            state: VpnState::Disconnected,
            stats: VpnStats::new(),
            connected_at: None,
        }
    }
}

/// Forwards session events into the engine task
struct ChannelEventHandler(mpsc::UnboundedSender<SessionEvent>);

impl ovpn_protocol::EventHandler for ChannelEventHandler {
    fn on_event(&self, event: SessionEvent) {
        let _ = self.0.send(event);
    }
}

/// Everything a session needs, resolved once per start
struct SessionPlan {
    client: ClientConfig,
    encryption: EncryptionParameters,
    credentials: Credentials,
    options: SessionOptions,
    tls_factory: Arc<dyn TlsFactory>,
    remotes: Vec<SocketAddr>,
}

/// Per-start loop resources
struct Runtime {
    shutdown_rx: broadcast::Receiver<()>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    session_events: Arc<dyn ovpn_protocol::EventHandler>,
    tunnel_rx: Option<mpsc::Receiver<Vec<u8>>>,
    data_count: (u64, u64),
}

/// VPN engine for managing a client connection
///
/// The engine handles:
/// - Opening UDP or TCP links to a configured remote
/// - Driving the session through handshake, data transfer and rekeying
/// - Moving plaintext packets to and from a host-provided tunnel
/// - Reconnecting after recoverable failures
pub struct VpnEngine {
    /// Configuration
    config: Config,

    /// Event handler
    event_handler: Arc<dyn EventHandler>,

    /// TLS implementation, rustls unless overridden
    tls_factory: Option<Arc<dyn TlsFactory>>,

    /// Session side of the tunnel, if the host attached one
    tunnel: Option<Arc<ChannelTunnel>>,

    /// Packets from the host waiting to be encrypted
    tunnel_rx: Option<mpsc::Receiver<Vec<u8>>>,

    /// Shutdown signal sender
    shutdown_tx: Option<broadcast::Sender<()>>,

    /// Engine state
    state: Arc<RwLock<EngineState>>,
}

impl std::fmt::Debug for VpnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnEngine").finish_non_exhaustive()
    }
}

impl VpnEngine {
    /// Create a new VPN engine with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        config.client_config()?;

        Ok(Self {
            config,
            event_handler: Arc::new(LoggingEventHandler),
            tls_factory: None,
            tunnel: None,
            tunnel_rx: None,
            shutdown_tx: None,
            state: Arc::new(RwLock::new(EngineState::new())),
        })
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Replace the rustls-based TLS implementation
    pub fn with_tls_factory(mut self, factory: Arc<dyn TlsFactory>) -> Self {
        self.tls_factory = Some(factory);
        self
    }

    /// Attach a tunnel and return the host's end of it
    ///
    /// A persistent tunnel is kept across reconnects, and the session is
    /// reset in place instead of being rebuilt.
    pub fn with_tunnel(mut self, persistent: bool) -> (Self, TunnelHandle) {
        let (tunnel, handle, outbound) = ChannelTunnel::new(persistent);
        self.tunnel = Some(Arc::new(tunnel));
        self.tunnel_rx = Some(outbound);
        (self, handle)
    }

    /// Get the current state
    pub async fn state(&self) -> VpnState {
        self.state.read().await.state
    }

    /// Get the current statistics
    pub async fn stats(&self) -> VpnStats {
        let state = self.state.read().await;
        let mut stats = state.stats.clone();
        if let Some(connected_at) = state.connected_at {
            stats.uptime = connected_at.elapsed();
        }
        stats
    }

    /// Start the VPN engine
    ///
    /// Runs until shutdown is requested or the session fails for a reason a
    /// reconnect cannot fix.
    pub async fn start(&mut self) -> Result<()> {
        let current_state = self.state.read().await.state;
        if current_state.is_active() {
            return Err(Error::AlreadyRunning);
        }

        // Use existing shutdown channel if one was pre-created, otherwise create new
        let shutdown_tx = if let Some(tx) = self.shutdown_tx.clone() {
            tx
        } else {
            let (tx, _) = broadcast::channel(1);
            self.shutdown_tx = Some(tx.clone());
            tx
        };

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let mut runtime = Runtime {
            shutdown_rx: shutdown_tx.subscribe(),
            session_rx,
            session_events: Arc::new(ChannelEventHandler(session_tx)),
            tunnel_rx: self.tunnel_rx.take(),
            data_count: (0, 0),
        };

        let result = self.run_client(&mut runtime).await;
        self.tunnel_rx = runtime.tunnel_rx.take();

        match &result {
            Ok(()) => self.set_state(VpnState::Disconnected).await,
            Err(e) => {
                self.emit_event(VpnEvent::Error {
                    message: e.to_string(),
                    recoverable: false,
                })
                .await;
                self.set_state(VpnState::Error).await;
            }
        }
        result
    }

    /// Get a shutdown handle that can be used to stop the engine from outside
    ///
    /// Returns None if the engine hasn't been started yet.
    pub fn shutdown_handle(&self) -> Option<broadcast::Sender<()>> {
        self.shutdown_tx.clone()
    }

    /// Create a shutdown handle before starting the engine
    ///
    /// This allows the caller to keep a handle that can be used to stop
    /// the engine after it has been moved into a task.
    pub fn create_shutdown_handle(&mut self) -> broadcast::Sender<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        shutdown_tx
    }

    /// Stop the VPN engine
    pub async fn stop(&mut self) -> Result<()> {
        let current_state = self.state.read().await.state;
        if !current_state.is_active() {
            return Err(Error::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        self.set_state(VpnState::Disconnecting).await;
        Ok(())
    }

    /// Update state and emit event
    async fn set_state(&self, new_state: VpnState) {
        let old_state = {
            let mut state = self.state.write().await;
            let old = state.state;
            state.state = new_state;
            if new_state == VpnState::Connected {
                state.connected_at = Some(std::time::Instant::now());
            } else if old == VpnState::Connected {
                state.connected_at = None;
            }
            old
        };

        if old_state != new_state {
            self.emit_event(VpnEvent::StateChanged {
                old: old_state,
                new: new_state,
            })
            .await;
        }
    }

    /// Emit an event to the handler
    async fn emit_event(&self, event: VpnEvent) {
        self.event_handler.on_event(event).await;
    }

    /// Log a message through the event system
    async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit_event(VpnEvent::Log {
            level,
            message: message.into(),
        })
        .await;
    }

    // ========================================================================
    // Client loop
    // ========================================================================

    fn plan(&self) -> Result<SessionPlan> {
        let client = self.config.client_config()?.clone();
        let encryption = client.encryption()?;
        let tls_factory: Arc<dyn TlsFactory> = match &self.tls_factory {
            Some(factory) => factory.clone(),
            None => Arc::new(RustlsFactory::new(&encryption.handshake)?),
        };
        let remotes = client.resolve_remotes()?;

        Ok(SessionPlan {
            credentials: client.credentials(),
            options: client.session_options(),
            client,
            encryption,
            tls_factory,
            remotes,
        })
    }

    fn new_session(&self, plan: &SessionPlan, runtime: &Runtime) -> SessionProxy {
        let mut session = SessionProxy::new(
            plan.encryption.clone(),
            plan.credentials.clone(),
            plan.options.clone(),
            plan.tls_factory.clone(),
            runtime.session_events.clone(),
        );
        if let Some(tunnel) = &self.tunnel {
            session.set_tunnel(tunnel.clone());
        }
        session
    }

    async fn run_client(&self, runtime: &mut Runtime) -> Result<()> {
        let plan = self.plan()?;
        let common = &self.config.common;

        self.log(
            LogLevel::Info,
            format!(
                "Connecting over {} to {} resolved remote(s), cipher {}",
                plan.client.proto,
                plan.remotes.len(),
                plan.client.cipher
            ),
        )
        .await;

        let mut session: Option<SessionProxy> = None;
        let mut attempts: u32 = 0;

        loop {
            let remote = plan
                .client
                .random_remote(&plan.remotes)
                .ok_or_else(|| Error::Config("no remote addresses available".into()))?;

            let mut current = match session.take() {
                Some(mut reused) => {
                    reused.cleanup();
                    reused
                }
                None => self.new_session(&plan, runtime),
            };

            self.set_state(VpnState::Connecting).await;
            let result = self.run_session(&plan, remote, &mut current, runtime).await;

            if self.tunnel.as_ref().is_some_and(|t| t.is_persistent()) {
                session = Some(current);
            }

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => e,
            };

            attempts += 1;
            if common.max_reconnect_attempts > 0 && attempts > common.max_reconnect_attempts {
                return Err(Error::Connection(format!(
                    "giving up after {} reconnect attempts: {}",
                    common.max_reconnect_attempts, err
                )));
            }

            self.emit_event(VpnEvent::Error {
                message: err.to_string(),
                recoverable: true,
            })
            .await;
            self.set_state(VpnState::Reconnecting).await;
            self.state.write().await.stats.reconnects += 1;
            self.log(
                LogLevel::Info,
                format!(
                    "Reconnecting in {}s (attempt {})",
                    common.reconnect_delay, attempts
                ),
            )
            .await;

            tokio::select! {
                _ = runtime.shutdown_rx.recv() => {
                    log::info!("Shutdown requested while waiting to reconnect");
                    return Ok(());
                }
                _ = tokio::time::sleep(common.reconnect_delay()) => {}
            }
        }
    }

    async fn open_link(
        &self,
        client: &ClientConfig,
        remote: SocketAddr,
    ) -> Result<(Box<dyn Link>, mpsc::Receiver<LinkEvent>)> {
        let options = LinkOptions {
            mtu: self.config.common.mtu as usize,
            hard_reset_timeout: client.hard_reset_timeout(),
            negotiation_timeout: client.negotiation_timeout(),
            communication_type: client.communication_type()?,
        };

        let (link, rx): (Box<dyn Link>, _) = match client.proto {
            Proto::Udp => {
                let (link, rx) = UdpLink::connect(remote, options).await?;
                (Box::new(link), rx)
            }
            Proto::Tcp => {
                let (link, rx) = TcpLink::connect(remote, options)
                    .await
                    .map_err(|e| Error::Connection(format!("TCP connect to {}: {}", remote, e)))?;
                (Box::new(link), rx)
            }
        };
        Ok((link, rx))
    }

    /// Drive one session on one link until it stops
    ///
    /// Ok means shutdown was requested.
    async fn run_session(
        &self,
        plan: &SessionPlan,
        remote: SocketAddr,
        session: &mut SessionProxy,
        runtime: &mut Runtime,
    ) -> Result<()> {
        let (link, mut link_rx) = self.open_link(&plan.client, remote).await?;
        self.log(LogLevel::Info, format!("Link open to {} ({})", remote, plan.client.proto))
            .await;

        runtime.data_count = (0, 0);
        session.set_link(link, now());

        let mut ticker = interval(session.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stats_period = self.config.common.stats_interval();
        let mut stats_ticker = interval(stats_period.unwrap_or(Duration::from_secs(3600)));
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_ticker.tick().await;

        loop {
            if let Some(outcome) = self.process_session_events(session, runtime, remote).await {
                return outcome;
            }
            self.update_data_count(session, runtime).await;

            tokio::select! {
                _ = runtime.shutdown_rx.recv() => {
                    log::info!("Client shutdown requested");
                    self.set_state(VpnState::Disconnecting).await;
                    session.shutdown(None);
                }
                event = link_rx.recv() => match event {
                    Some(LinkEvent::Packets(packets)) => {
                        session.receive_link(&packets, now());
                    }
                    Some(LinkEvent::WriteFailed(reason)) => {
                        log::warn!("Link write to {} failed: {}", remote, reason);
                        session.link_write_failed();
                    }
                    Some(LinkEvent::Closed(reason)) => {
                        link_rx = self.relink(plan, remote, session, link_rx, reason).await;
                    }
                    None => {
                        link_rx = self.relink(plan, remote, session, link_rx, "link tasks ended".into()).await;
                    }
                },
                packet = recv_tunnel(&mut runtime.tunnel_rx) => match packet {
                    Some(packet) => {
                        let mut batch = vec![packet];
                        if let Some(rx) = runtime.tunnel_rx.as_mut() {
                            while batch.len() < TUNNEL_BATCH {
                                match rx.try_recv() {
                                    Ok(packet) => batch.push(packet),
                                    Err(_) => break,
                                }
                            }
                        }
                        session.receive_tunnel(&batch, now());
                    }
                    None => {
                        log::debug!("Tunnel host went away");
                        runtime.tunnel_rx = None;
                    }
                },
                _ = ticker.tick() => {
                    session.tick(now());
                }
                _ = stats_ticker.tick(), if stats_period.is_some() => {
                    let stats = self.stats().await;
                    self.emit_event(VpnEvent::StatsUpdate(stats)).await;
                }
            }
        }
    }

    /// Replace a closed link, or stop the session if it cannot move
    async fn relink(
        &self,
        plan: &SessionPlan,
        remote: SocketAddr,
        session: &mut SessionProxy,
        old_rx: mpsc::Receiver<LinkEvent>,
        reason: String,
    ) -> mpsc::Receiver<LinkEvent> {
        log::warn!("Link to {} closed: {}", remote, reason);

        if session.can_rebind_link() {
            match self.open_link(&plan.client, remote).await {
                Ok((link, rx)) => {
                    if session.rebind_link(link, now()) {
                        self.log(LogLevel::Info, format!("Rebound session to new link to {}", remote))
                            .await;
                        return rx;
                    }
                }
                Err(e) => log::warn!("Failed to reopen link: {}", e),
            }
        }

        session.reconnect(Some(ovpn_protocol::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            reason,
        ))));
        old_rx
    }

    /// Forward pending session events; returns the outcome once the session stopped
    async fn process_session_events(
        &self,
        session: &mut SessionProxy,
        runtime: &mut Runtime,
        remote: SocketAddr,
    ) -> Option<Result<()>> {
        while let Ok(event) = runtime.session_rx.try_recv() {
            match event {
                SessionEvent::Started {
                    address,
                    gateway_address,
                    dns_servers,
                    ..
                } => {
                    self.set_state(VpnState::Connected).await;
                    self.emit_event(VpnEvent::Connected {
                        remote,
                        address: address.to_string(),
                        gateway: gateway_address.to_string(),
                        dns_servers: dns_servers.iter().map(ToString::to_string).collect(),
                    })
                    .await;
                }
                SessionEvent::Stopped {
                    should_reconnect,
                    reason,
                } => {
                    let recoverable = should_reconnect
                        || session.stop_error().is_some_and(|e| e.is_recoverable());
                    let requested = reason.is_none() && !should_reconnect;
                    let reason = reason.unwrap_or_else(|| "stopped on request".to_string());

                    self.state.write().await.connected_at = None;
                    self.emit_event(VpnEvent::Disconnected {
                        reason: reason.clone(),
                    })
                    .await;

                    return Some(if requested {
                        Ok(())
                    } else if recoverable {
                        Err(Error::Connection(reason))
                    } else {
                        Err(Error::Stopped(reason))
                    });
                }
            }
        }
        None
    }

    async fn update_data_count(&self, session: &mut SessionProxy, runtime: &mut Runtime) {
        let (rx, tx) = session.data_count();
        let (last_rx, last_tx) = runtime.data_count;
        if rx == last_rx && tx == last_tx {
            return;
        }
        runtime.data_count = (rx, tx);

        let mut state = self.state.write().await;
        state.stats.record_rx(rx.saturating_sub(last_rx));
        state.stats.record_tx(tx.saturating_sub(last_tx));
    }
}

/// Session clock, following tokio's so paused-time tests stay consistent
fn now() -> std::time::Instant {
    TokioInstant::now().into_std()
}

async fn recv_tunnel(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
