//! Session manager: owns the bind/rebind lifecycle of one SMPP session and is the
//! only way to submit messages over it.
//!
//! A single background task owns the connection's read loop and every lifecycle
//! transition it observes. Any number of tasks may call [`SessionManager::submit`]
//! concurrently; writes are serialized per link and admitted through a shared
//! [`RateLimiter`]. Inbound frames go to the [`InboundRouter`], which never blocks
//! the read loop, and every transition is published through the
//! [`ConnectionMonitor`].
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> Connecting -> ...
//!              \-> BindFailed -> Connecting -> ...
//! any state -> Closed (terminal, after close())
//! ```

use crate::monitor::{ConnectionMonitor, StatusStream};
use crate::rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
use crate::router::InboundRouter;
use async_trait::async_trait;
use sms_core::{
    fallback_id, BindMode, CommandId, Connection, ConnectionState, ConnectionStatus, Connector,
    Credentials, Frame, InboundHandler, OutboundMessage, SubmissionResult, SubmitError,
    SubmitResponse, Submitter, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// What to do after a bind attempt fails or an established link is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindPolicy {
    /// Stay down until `close()`.
    Never,
    /// Retry straight away.
    Immediate,
    /// Retry after `base`, doubling up to `max`; reset after a successful bind.
    Backoff { base: Duration, max: Duration },
}

impl Default for RebindPolicy {
    fn default() -> Self {
        RebindPolicy::Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

struct Backoff {
    policy: RebindPolicy,
    current: Duration,
}

impl Backoff {
    fn new(policy: RebindPolicy) -> Self {
        let current = match policy {
            RebindPolicy::Backoff { base, .. } => base,
            _ => Duration::ZERO,
        };
        Self { policy, current }
    }

    /// `None` when the policy forbids another attempt.
    fn next_delay(&mut self) -> Option<Duration> {
        match self.policy {
            RebindPolicy::Never => None,
            RebindPolicy::Immediate => Some(Duration::ZERO),
            RebindPolicy::Backoff { max, .. } => {
                let delay = self.current;
                let next = self.current.checked_mul(2).unwrap_or(max);
                self.current = next.min(max);
                Some(delay)
            }
        }
    }

    fn reset(&mut self) {
        if let RebindPolicy::Backoff { base, .. } = self.policy {
            self.current = base;
        }
    }
}

/// Everything the session manager needs to (re)establish the session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: String,
    pub credentials: Credentials,
    pub bind_mode: BindMode,
    /// Upper bound on one bind handshake.
    pub bind_timeout: Duration,
    /// Upper bound on handing one frame to the transport and getting its ack.
    pub submit_timeout: Duration,
    /// Keep-alive period; `None` disables enquire_link.
    pub enquire_link_interval: Option<Duration>,
    /// Inbound events buffered for a slow handler before drop-oldest.
    pub inbound_queue_depth: usize,
    /// Status events buffered per subscriber before drop-oldest.
    pub status_buffer: usize,
    pub rebind: RebindPolicy,
    pub rate_limit: RateLimitConfig,
}

impl SessionConfig {
    pub fn new<S: Into<String>>(address: S, credentials: Credentials, bind_mode: BindMode) -> Self {
        Self {
            address: address.into(),
            credentials,
            bind_mode,
            bind_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(1),
            enquire_link_interval: Some(Duration::from_secs(10)),
            inbound_queue_depth: 256,
            status_buffer: 64,
            rebind: RebindPolicy::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.address.trim().is_empty() {
            return Err(SessionError::InvalidConfig("address is empty".into()));
        }
        if self.bind_timeout.is_zero() || self.submit_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "bind and submit timeouts must be positive".into(),
            ));
        }
        if self.enquire_link_interval == Some(Duration::ZERO) {
            return Err(SessionError::InvalidConfig(
                "enquire_link interval must be positive".into(),
            ));
        }
        let rate = self.rate_limit.requests_per_second;
        if self.rate_limit.enabled && !(rate > 0.0 && rate.is_finite()) {
            return Err(SessionError::InvalidConfig(format!(
                "requests_per_second must be a positive finite number, got {rate}"
            )));
        }
        Ok(())
    }
}

/// Errors from session management calls other than `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("session is closed")]
    Closed,
}

/// One bound connection. Replaced on every rebind.
struct Link {
    id: u64,
    conn: Arc<dyn Connection>,
    // Held for the duration of one send, so exactly one writer at a time.
    writer: tokio::sync::Mutex<()>,
    failed: AtomicBool,
    lost: watch::Sender<Option<TransportError>>,
}

impl Link {
    fn new(id: u64, conn: Arc<dyn Connection>) -> Self {
        let (lost, _) = watch::channel(None);
        Self {
            id,
            conn,
            writer: tokio::sync::Mutex::new(()),
            failed: AtomicBool::new(false),
            lost,
        }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Resolves once a writer reported the link dead.
    async fn wait_lost(&self) -> TransportError {
        let mut rx = self.lost.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        result.ok().and_then(|err| err.clone()).unwrap_or(TransportError::Closed)
    }
}

enum TaskSlot {
    NotStarted,
    Running(JoinHandle<()>),
    Finished,
}

enum LinkOutcome {
    Shutdown,
    Lost(TransportError),
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    limiter: RateLimiter,
    monitor: ConnectionMonitor,
    router: InboundRouter,
    link: RwLock<Option<Arc<Link>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<TaskSlot>,
    sequence: AtomicU32,
    link_ids: AtomicU64,
}

/// Handle to one gateway session. Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("address", &self.shared.config.address)
            .field("bind_mode", &self.shared.config.bind_mode)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionManager {
    /// Create an idle session. Must be called inside a Tokio runtime: the inbound
    /// dispatcher task starts here.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (router, _dispatcher) = InboundRouter::spawn(handler, config.inbound_queue_depth);
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            limiter: RateLimiter::new(config.rate_limit.clone()),
            monitor: ConnectionMonitor::new(config.status_buffer),
            router,
            connector,
            link: RwLock::new(None),
            shutdown,
            task: Mutex::new(TaskSlot::NotStarted),
            sequence: AtomicU32::new(1),
            link_ids: AtomicU64::new(0),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Start the bind loop and return a status stream beginning with `Connecting`.
    ///
    /// Calling it again while the loop runs just returns another subscription.
    pub fn bind(&self) -> Result<StatusStream, SessionError> {
        let mut task = self.shared.lock_task();
        match *task {
            TaskSlot::Finished => Err(SessionError::Closed),
            TaskSlot::Running(_) => Ok(self.shared.monitor.subscribe()),
            TaskSlot::NotStarted => {
                let stream = self.shared.monitor.subscribe();
                info!(
                    address = %self.shared.config.address,
                    mode = ?self.shared.config.bind_mode,
                    "Starting SMPP session"
                );
                *task = TaskSlot::Running(tokio::spawn(self.shared.clone().run()));
                Ok(stream)
            }
        }
    }

    /// Observe lifecycle events from now on.
    pub fn subscribe(&self) -> StatusStream {
        self.shared.monitor.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.monitor.state()
    }

    /// Wait until the session is connected. Returns false on timeout or close.
    pub async fn wait_connected(&self, within: Duration) -> bool {
        let mut rx = self.shared.monitor.watch();
        let ready = rx.wait_for(|s| *s == ConnectionState::Connected || s.is_terminal());
        match timeout(within, ready).await {
            Ok(Ok(state)) => *state == ConnectionState::Connected,
            _ => false,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// Inbound events dropped because the handler could not keep up.
    pub fn inbound_dropped(&self) -> u64 {
        self.shared.router.dropped()
    }

    /// Submit one message. Fails fast with `NotConnected` unless the session is
    /// connected; nothing is queued across disconnections.
    pub async fn submit(&self, message: &OutboundMessage) -> SubmissionResult {
        let shared = &self.shared;
        let link = shared.connected_link().ok_or(SubmitError::NotConnected)?;
        if !shared.config.bind_mode.can_submit() {
            return Err(SubmitError::Invalid(format!(
                "{:?} bind cannot submit messages",
                shared.config.bind_mode
            )));
        }
        message.validate()?;

        let mut shutdown = shared.shutdown.subscribe();
        let max_wait = shared.config.rate_limit.max_wait();
        let admission = tokio::select! {
            _ = closing(&mut shutdown) => return Err(SubmitError::NotConnected),
            result = shared.limiter.acquire(1, max_wait) => result,
        };
        if let RateLimitResult::Limited { retry_after } = admission {
            debug!(?retry_after, dst = %message.destination, "Submission rate limited");
            return Err(SubmitError::RateLimited { retry_after });
        }

        let frame = message.to_frame().with_sequence(shared.next_sequence());
        let ack = tokio::select! {
            _ = closing(&mut shutdown) => return Err(TransportError::Closed.into()),
            result = shared.write(&link, frame) => result?,
        };
        let message_id = if ack.is_empty() { fallback_id() } else { ack };
        debug!(%message_id, src = %message.source, dst = %message.destination, "Message submitted");
        Ok(SubmitResponse { message_id })
    }

    /// Unbind (if connected) and release the connection. Idempotent and safe to
    /// call concurrently; every caller returns once the session is `Closed`.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.shutdown.send_replace(true);

        let slot = std::mem::replace(&mut *shared.lock_task(), TaskSlot::Finished);
        match slot {
            TaskSlot::Running(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "Session task ended abnormally");
                    if !shared.monitor.state().is_terminal() {
                        let _ = shared
                            .monitor
                            .transition(ConnectionStatus::with_error(ConnectionState::Closed, e));
                    }
                }
                shared.router.close();
            }
            TaskSlot::NotStarted => {
                let _ = shared
                    .monitor
                    .transition(ConnectionStatus::new(ConnectionState::Closed));
                shared.router.close();
            }
            TaskSlot::Finished => {}
        }

        let mut rx = shared.monitor.watch();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

#[async_trait]
impl Submitter for SessionManager {
    async fn submit(&self, message: &OutboundMessage) -> SubmissionResult {
        SessionManager::submit(self, message).await
    }

    fn state(&self) -> ConnectionState {
        SessionManager::state(self)
    }
}

impl Shared {
    fn lock_task(&self) -> MutexGuard<'_, TaskSlot> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn connected_link(&self) -> Option<Arc<Link>> {
        if *self.shutdown.borrow() || self.monitor.state() != ConnectionState::Connected {
            return None;
        }
        let link = self.link.read().unwrap_or_else(|e| e.into_inner());
        link.as_ref().filter(|l| !l.is_failed()).cloned()
    }

    fn attach(&self, link: Arc<Link>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }

    fn detach(&self, link: &Link) {
        let mut slot = self.link.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|l| l.id == link.id) {
            *slot = None;
        }
    }

    /// Hand one frame to the link, one writer at a time, bounded by `submit_timeout`.
    async fn write(&self, link: &Link, frame: Frame) -> Result<String, SubmitError> {
        let limit = self.config.submit_timeout;
        let send = async {
            let _writer = link.writer.lock().await;
            if link.is_failed() {
                return Err(SubmitError::NotConnected);
            }
            trace!(command = ?frame.command, seq = frame.sequence, "Writing frame");
            link.conn.send(frame).await.map_err(|e| {
                self.link_failed(link, e.clone());
                SubmitError::Transport(e)
            })
        };
        match timeout(limit, send).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?limit, "Transport did not acknowledge in time");
                Err(TransportError::Timeout(limit).into())
            }
        }
    }

    /// Downgrade to `Disconnected` once per link and wake the read loop.
    fn link_failed(&self, link: &Link, err: TransportError) {
        if link.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach(link);
        self.monitor.transition_from(
            ConnectionState::Connected,
            ConnectionStatus::with_error(ConnectionState::Disconnected, &err),
        );
        link.lost.send_replace(Some(err));
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::new(self.config.rebind);

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.publish(ConnectionStatus::new(ConnectionState::Connecting));

            let attempt = timeout(
                self.config.bind_timeout,
                self.connector.connect(
                    self.config.bind_mode,
                    &self.config.address,
                    &self.config.credentials,
                ),
            );
            let bound = tokio::select! {
                _ = closing(&mut shutdown) => break,
                result = attempt => match result {
                    Ok(bound) => bound,
                    Err(_) => Err(TransportError::Timeout(self.config.bind_timeout)),
                },
            };

            match bound {
                Ok(conn) => {
                    backoff.reset();
                    let id = self.link_ids.fetch_add(1, Ordering::Relaxed);
                    let link = Arc::new(Link::new(id, conn));
                    self.attach(link.clone());
                    self.publish(ConnectionStatus::new(ConnectionState::Connected));

                    let keepalive = self.config.enquire_link_interval.map(|period| {
                        tokio::spawn(keepalive(self.clone(), link.clone(), period))
                    });
                    let outcome = self.serve(&link, &mut shutdown).await;
                    if let Some(task) = keepalive {
                        task.abort();
                    }

                    match outcome {
                        LinkOutcome::Shutdown => {
                            self.detach(&link);
                            self.unbind(&link).await;
                            break;
                        }
                        LinkOutcome::Lost(err) => {
                            self.link_failed(&link, err);
                            self.release(&link).await;
                        }
                    }
                }
                Err(e) => {
                    error!(address = %self.config.address, error = %e, "SMPP bind failed");
                    self.publish(ConnectionStatus::with_error(ConnectionState::BindFailed, e));
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        info!(?delay, "Rebinding after delay");
                        tokio::select! {
                            _ = closing(&mut shutdown) => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                None => {
                    info!("Rebind disabled, session stays down until closed");
                    closing(&mut shutdown).await;
                    break;
                }
            }
        }

        self.publish(ConnectionStatus::new(ConnectionState::Closed));
    }

    /// Read loop for one link. Returns when the link dies or shutdown is requested.
    async fn serve(&self, link: &Link, shutdown: &mut watch::Receiver<bool>) -> LinkOutcome {
        loop {
            tokio::select! {
                _ = closing(shutdown) => return LinkOutcome::Shutdown,
                err = link.wait_lost() => return LinkOutcome::Lost(err),
                frame = link.conn.receive() => match frame {
                    Ok(frame) if frame.command == CommandId::Unbind => {
                        info!("Remote requested unbind");
                        return LinkOutcome::Lost(TransportError::RemoteClosed);
                    }
                    Ok(frame) => {
                        self.router.route(&frame);
                    }
                    Err(e) => return LinkOutcome::Lost(e),
                },
            }
        }
    }

    /// Graceful unbind on close. Waits for the writer so no send is cut in half.
    async fn unbind(&self, link: &Link) {
        let _writer = link.writer.lock().await;
        match timeout(self.config.bind_timeout, link.conn.close()).await {
            Ok(Ok(())) => info!("SMPP session unbound"),
            Ok(Err(e)) => warn!(error = %e, "Unbind failed"),
            Err(_) => warn!("Unbind timed out"),
        }
    }

    /// Drop a dead link without waiting on writers.
    async fn release(&self, link: &Link) {
        match timeout(self.config.bind_timeout, link.conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Closing lost link failed"),
            Err(_) => debug!("Closing lost link timed out"),
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        // Invalid transitions assert inside the monitor.
        let _ = self.monitor.transition(status);
    }
}

async fn keepalive(shared: Arc<Shared>, link: Arc<Link>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let frame = Frame::new(CommandId::EnquireLink).with_sequence(shared.next_sequence());
        match shared.write(&link, frame).await {
            Ok(_) => trace!("enquire_link acknowledged"),
            Err(SubmitError::NotConnected) => break,
            Err(SubmitError::Transport(TransportError::Timeout(limit))) => {
                warn!(?limit, "enquire_link timed out");
                shared.link_failed(&link, TransportError::Timeout(limit));
                break;
            }
            Err(e) => {
                warn!(error = %e, "enquire_link failed");
                break;
            }
        }
    }
}

/// Resolves once shutdown has been requested.
async fn closing(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(RebindPolicy::Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
        });
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn never_policy_gives_no_delay() {
        assert_eq!(Backoff::new(RebindPolicy::Never).next_delay(), None);
        assert_eq!(
            Backoff::new(RebindPolicy::Immediate).next_delay(),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn config_rejects_empty_address() {
        let config = SessionConfig::new("  ", Credentials::new("u", "p"), BindMode::Transceiver);
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_rejects_zero_keepalive() {
        let mut config =
            SessionConfig::new("127.0.0.1:2775", Credentials::new("u", "p"), BindMode::Transceiver);
        assert!(config.validate().is_ok());
        config.enquire_link_interval = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_unusable_refill_rate() {
        let mut config =
            SessionConfig::new("127.0.0.1:2775", Credentials::new("u", "p"), BindMode::Transceiver);
        for rate in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            config.rate_limit.requests_per_second = rate;
            assert!(matches!(
                config.validate(),
                Err(SessionError::InvalidConfig(_))
            ));
        }

        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());
    }
}
