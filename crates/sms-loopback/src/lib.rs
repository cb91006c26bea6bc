//! # Loopback SMSC
//!
//! In-process [`Connector`] that behaves like an SMSC without touching the network.
//! Binds are checked against optional expected credentials, submitted frames are
//! recorded and acknowledged with a fresh message id, and the test or demo driving
//! it can inject inbound frames, drop the link or make the next send fail.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sms_loopback::LoopbackSmsc;
//!
//! let smsc = LoopbackSmsc::new();
//! // hand `Arc::new(smsc.clone())` to the session manager, then:
//! smsc.deliver_sm("996771977377", "6791", b"hi");
//! smsc.drop_link();
//! ```

use async_trait::async_trait;
use sms_core::{
    fallback_id, BindMode, CommandId, Connection, Connector, Credentials, Field, Frame,
    TransportError, ESM_CLASS_DELIVERY_RECEIPT,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct SmscState {
    expected: Option<Credentials>,
    bind_failures: VecDeque<TransportError>,
    bind_delay: Duration,
    send_failures: VecDeque<TransportError>,
    send_delay: Duration,
    auto_receipts: bool,
    bind_attempts: usize,
    binds: usize,
    unbinds: usize,
    submitted: Vec<Frame>,
    current: Option<Arc<LoopbackConnection>>,
}

/// Simulated SMSC. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackSmsc {
    state: Arc<Mutex<SmscState>>,
}

impl LoopbackSmsc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept binds presenting these credentials.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.lock().expected = Some(credentials);
        self
    }

    /// Answer every delivery-receipt request with a `DELIVRD` receipt.
    pub fn with_auto_receipts(self, enabled: bool) -> Self {
        self.lock().auto_receipts = enabled;
        self
    }

    pub fn set_bind_delay(&self, delay: Duration) {
        self.lock().bind_delay = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.lock().send_delay = delay;
    }

    /// Fail the next bind attempt with `error`. Calls queue up.
    pub fn fail_next_bind(&self, error: TransportError) {
        self.lock().bind_failures.push_back(error);
    }

    /// Fail the next send with `error`; the link is dead afterwards.
    pub fn fail_next_send(&self, error: TransportError) {
        self.lock().send_failures.push_back(error);
    }

    /// Push a frame to the bound client. Returns false when nobody is bound.
    pub fn deliver(&self, frame: Frame) -> bool {
        match self.lock().current.clone() {
            Some(conn) => conn.push(Ok(frame)),
            None => false,
        }
    }

    /// Push a mobile-originated deliver_sm.
    pub fn deliver_sm(&self, source: &str, destination: &str, body: &[u8]) -> bool {
        self.deliver(
            Frame::new(CommandId::DeliverSm)
                .with_field(Field::SourceAddr, source.as_bytes())
                .with_field(Field::DestinationAddr, destination.as_bytes())
                .with_field(Field::ShortMessage, body),
        )
    }

    /// Simulate a connection reset on the current link.
    pub fn drop_link(&self) -> bool {
        let conn = self.lock().current.take();
        match conn {
            Some(conn) => {
                info!(link = conn.id, "Loopback SMSC dropping link");
                conn.mark_closed();
                conn.push(Err(TransportError::Io("connection reset by peer".into())))
            }
            None => false,
        }
    }

    pub fn submitted(&self) -> Vec<Frame> {
        self.lock().submitted.clone()
    }

    pub fn bind_attempts(&self) -> usize {
        self.lock().bind_attempts
    }

    pub fn binds(&self) -> usize {
        self.lock().binds
    }

    pub fn unbinds(&self) -> usize {
        self.lock().unbinds
    }

    pub fn is_bound(&self) -> bool {
        self.lock().current.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, SmscState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for LoopbackSmsc {
    async fn connect(
        &self,
        mode: BindMode,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.bind_attempts += 1;
            state.bind_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if address.trim().is_empty() {
            return Err(TransportError::Unreachable("empty address".into()));
        }
        if let Some(error) = state.bind_failures.pop_front() {
            return Err(error);
        }
        if state.expected.as_ref().is_some_and(|c| c != credentials) {
            return Err(TransportError::BindRejected(format!(
                "invalid credentials for {}",
                credentials.system_id
            )));
        }

        state.binds += 1;
        let conn = Arc::new(LoopbackConnection::new(state.binds, mode, self.clone()));
        if let Some(previous) = state.current.replace(conn.clone()) {
            previous.mark_closed();
        }
        info!(link = conn.id, ?mode, %address, "Loopback SMSC accepted bind");
        Ok(conn)
    }
}

/// One bound link of a [`LoopbackSmsc`].
#[derive(Debug)]
pub struct LoopbackConnection {
    id: usize,
    mode: BindMode,
    smsc: LoopbackSmsc,
    inbound_tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>,
    closed: Mutex<bool>,
}

impl LoopbackConnection {
    fn new(id: usize, mode: BindMode, smsc: LoopbackSmsc) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            id,
            mode,
            smsc,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed: Mutex::new(false),
        }
    }

    fn push(&self, item: Result<Frame, TransportError>) -> bool {
        self.inbound_tx.send(item).is_ok()
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_closed(&self) {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    fn receipt_for(submit: &Frame, message_id: &str) -> Frame {
        let src = submit.field(Field::SourceAddr).unwrap_or_default().to_vec();
        let dst = submit.field(Field::DestinationAddr).unwrap_or_default().to_vec();
        Frame::new(CommandId::DeliverSm)
            .with_field(Field::SourceAddr, dst)
            .with_field(Field::DestinationAddr, src)
            .with_field(Field::EsmClass, [ESM_CLASS_DELIVERY_RECEIPT])
            .with_field(
                Field::ShortMessage,
                format!("id:{message_id} sub:001 dlvrd:001 stat:DELIVRD err:000"),
            )
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send(&self, frame: Frame) -> Result<String, TransportError> {
        let delay = self.smsc.lock().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut state = self.smsc.lock();
        if let Some(error) = state.send_failures.pop_front() {
            drop(state);
            self.mark_closed();
            return Err(error);
        }

        debug!(link = self.id, command = ?frame.command, seq = frame.sequence, "Loopback SMSC received frame");
        let ack = match frame.command {
            CommandId::SubmitSm => {
                let message_id = fallback_id();
                if state.auto_receipts && frame.octet(Field::RegisteredDelivery) != 0 {
                    self.push(Ok(Self::receipt_for(&frame, &message_id)));
                }
                message_id
            }
            _ => String::new(),
        };
        state.submitted.push(frame);
        Ok(ack)
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        if !self.mode.can_receive() {
            // Transmitter binds still learn about link loss.
            loop {
                match rx.recv().await {
                    Some(Err(e)) => return Err(e),
                    Some(Ok(_)) => continue,
                    None => return Err(TransportError::Closed),
                }
            }
        }
        rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.mark_closed();
        let mut state = self.smsc.lock();
        state.unbinds += 1;
        if state.current.as_ref().is_some_and(|c| c.id == self.id) {
            state.current = None;
        }
        self.push(Err(TransportError::Closed));
        info!(link = self.id, "Loopback SMSC unbound");
        Ok(())
    }
}
