//! Inbound frame classification and handler dispatch.
//!
//! The session read loop calls [`InboundRouter::route`], which never awaits: events
//! are parked in a bounded queue and a dedicated dispatcher task feeds them to the
//! [`InboundHandler`] one at a time, in arrival order. When the handler falls behind
//! and the queue is full, the oldest queued event is dropped.

use async_trait::async_trait;
use futures::FutureExt;
use sms_core::{
    CommandId, DataCoding, Field, Frame, FrameError, InboundEvent, InboundHandler, InboundKind,
    ESM_CLASS_DELIVERY_RECEIPT,
};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// What [`InboundRouter::route`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Queued for the handler
    Dispatched,
    /// Not a message kind the handler cares about
    Ignored,
    /// Message kind, but unusable; logged and discarded
    Malformed,
}

/// Turn a frame into an [`InboundEvent`].
///
/// `Ok(None)` for frame kinds that carry no message for the handler.
pub fn classify(frame: &Frame) -> Result<Option<InboundEvent>, FrameError> {
    let kind = match frame.command {
        CommandId::DeliverSm if frame.octet(Field::EsmClass) & ESM_CLASS_DELIVERY_RECEIPT != 0 => {
            InboundKind::DeliveryReceipt
        }
        CommandId::DeliverSm | CommandId::DataSm => InboundKind::MobileOriginated,
        _ => return Ok(None),
    };

    let source = address(frame, Field::SourceAddr)?;
    let destination = address(frame, Field::DestinationAddr)?;
    let body = match (frame.field(Field::ShortMessage), frame.field(Field::MessagePayload)) {
        (Some(sm), Some(payload)) if sm.is_empty() => payload,
        (Some(sm), _) => sm,
        (None, Some(payload)) => payload,
        (None, None) if frame.command == CommandId::DataSm => {
            return Err(FrameError::MissingField(Field::MessagePayload))
        }
        (None, None) => return Err(FrameError::MissingField(Field::ShortMessage)),
    };

    Ok(Some(InboundEvent {
        kind,
        source,
        destination,
        body: body.to_vec(),
        coding: DataCoding::from_u8(frame.octet(Field::DataCoding)),
    }))
}

fn address(frame: &Frame, field: Field) -> Result<String, FrameError> {
    let raw = frame.require(field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidAddress(field))
}

#[derive(Debug)]
struct RouterInner {
    queue: Mutex<VecDeque<InboundEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl RouterInner {
    fn lock(&self) -> MutexGuard<'_, VecDeque<InboundEvent>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle used by the read loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InboundRouter {
    inner: Arc<RouterInner>,
}

impl InboundRouter {
    /// Start the dispatcher task. `capacity` bounds the number of events waiting
    /// for the handler.
    pub fn spawn(handler: Arc<dyn InboundHandler>, capacity: usize) -> (Self, JoinHandle<()>) {
        let inner = Arc::new(RouterInner {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let task = tokio::spawn(dispatch(inner.clone(), handler));
        (Self { inner }, task)
    }

    /// Classify `frame` and queue it for the handler. Never blocks.
    pub fn route(&self, frame: &Frame) -> Route {
        let event = match classify(frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                trace!(command = ?frame.command, seq = frame.sequence, "Ignoring frame");
                return Route::Ignored;
            }
            Err(e) => {
                warn!(command = ?frame.command, seq = frame.sequence, error = %e, "Discarding malformed frame");
                return Route::Malformed;
            }
        };

        {
            // `closed` is read under the queue lock so nothing lands after the final drain.
            let mut queue = self.inner.lock();
            if self.inner.closed.load(Ordering::Acquire) {
                debug!("Router closed, discarding inbound event");
                return Route::Ignored;
            }
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, capacity = self.inner.capacity, "Inbound handler is slow, dropped oldest event");
            }
            queue.push_back(event);
        }
        self.inner.notify.notify_one();
        Route::Dispatched
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Events waiting for the handler.
    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }

    /// Stop accepting events. The dispatcher drains what is queued, then exits.
    pub fn close(&self) {
        {
            let _queue = self.inner.lock();
            self.inner.closed.store(true, Ordering::Release);
        }
        self.inner.notify.notify_one();
    }
}

async fn dispatch(inner: Arc<RouterInner>, handler: Arc<dyn InboundHandler>) {
    loop {
        let next = {
            let mut queue = inner.lock();
            match queue.pop_front() {
                Some(event) => Some(event),
                None if inner.closed.load(Ordering::Acquire) => break,
                None => None,
            }
        };
        match next {
            Some(event) => {
                let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
                if outcome.is_err() {
                    error!("Inbound handler panicked, continuing with next event");
                }
            }
            None => inner.notify.notified().await,
        }
    }
    debug!("Inbound dispatcher stopped");
}

/// Logs every inbound message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl InboundHandler for LoggingHandler {
    async fn handle(&self, event: InboundEvent) {
        match event.kind {
            InboundKind::DeliveryReceipt => info!(
                "Delivery receipt from={} to={}: {}",
                event.source,
                event.destination,
                event.text()
            ),
            InboundKind::MobileOriginated => info!(
                "Short message from={} to={}: {}",
                event.source,
                event.destination,
                event.text()
            ),
        }
    }
}

/// Forwards inbound events into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<InboundEvent>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<InboundEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl InboundHandler for ChannelHandler {
    async fn handle(&self, event: InboundEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Inbound channel receiver dropped");
        }
    }
}

/// Adapts a plain closure into an [`InboundHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> InboundHandler for FnHandler<F>
where
    F: Fn(InboundEvent) + Send + Sync,
{
    async fn handle(&self, event: InboundEvent) {
        (self.0)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn deliver(src: &str, dst: &str, body: &[u8]) -> Frame {
        Frame::new(CommandId::DeliverSm)
            .with_field(Field::SourceAddr, src.as_bytes())
            .with_field(Field::DestinationAddr, dst.as_bytes())
            .with_field(Field::ShortMessage, body)
    }

    #[test]
    fn classify_preserves_addresses_and_body() {
        let body = [0x00, 0xFF, 0x10, b'h', b'i'];
        let event = classify(&deliver("996771977377", "6791", &body))
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, InboundKind::MobileOriginated);
        assert_eq!(event.source, "996771977377");
        assert_eq!(event.destination, "6791");
        assert_eq!(event.body, body);
    }

    #[test]
    fn classify_detects_delivery_receipts() {
        let frame = deliver("1", "2", b"id:1 stat:DELIVRD")
            .with_field(Field::EsmClass, [ESM_CLASS_DELIVERY_RECEIPT]);
        let event = classify(&frame).unwrap().unwrap();
        assert_eq!(event.kind, InboundKind::DeliveryReceipt);
    }

    #[test]
    fn classify_ignores_non_message_kinds() {
        for command in [
            CommandId::EnquireLink,
            CommandId::SubmitSmResp,
            CommandId::GenericNack,
            CommandId::Other(0x42),
        ] {
            let frame = Frame::new(command).with_field(Field::ShortMessage, b"x".to_vec());
            assert_eq!(classify(&frame), Ok(None));
        }
    }

    #[test]
    fn classify_rejects_missing_fields() {
        let frame = Frame::new(CommandId::DeliverSm).with_field(Field::SourceAddr, b"1".to_vec());
        assert_eq!(
            classify(&frame),
            Err(FrameError::MissingField(Field::DestinationAddr))
        );

        let frame = Frame::new(CommandId::DataSm)
            .with_field(Field::SourceAddr, b"1".to_vec())
            .with_field(Field::DestinationAddr, b"2".to_vec());
        assert_eq!(
            classify(&frame),
            Err(FrameError::MissingField(Field::MessagePayload))
        );
    }

    #[test]
    fn classify_uses_payload_when_short_message_empty() {
        let frame = deliver("1", "2", b"").with_field(Field::MessagePayload, b"long".to_vec());
        assert_eq!(classify(&frame).unwrap().unwrap().body, b"long");
    }

    #[test]
    fn classify_rejects_non_utf8_address() {
        let frame = deliver("1", "2", b"x").with_field(Field::SourceAddr, vec![0xFF, 0xFE]);
        assert_eq!(
            classify(&frame),
            Err(FrameError::InvalidAddress(Field::SourceAddr))
        );
    }

    #[tokio::test]
    async fn routed_events_reach_handler_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let (router, _task) = InboundRouter::spawn(Arc::new(ChannelHandler::new(tx)), 16);

        assert_eq!(router.route(&Frame::new(CommandId::EnquireLink)), Route::Ignored);
        for i in 0..5 {
            let body = format!("msg {i}");
            assert_eq!(
                router.route(&deliver("1", "2", body.as_bytes())),
                Route::Dispatched
            );
        }

        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.body, format!("msg {i}").into_bytes());
        }
    }

    struct GatedHandler {
        gate: Arc<Semaphore>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl InboundHandler for GatedHandler {
        async fn handle(&self, event: InboundEvent) {
            let _permit = self.gate.acquire().await.unwrap();
            let _ = self.tx.send(event.body);
        }
    }

    #[tokio::test]
    async fn slow_handler_drops_oldest_without_blocking_route() {
        let gate = Arc::new(Semaphore::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GatedHandler {
            gate: gate.clone(),
            tx,
        });
        let (router, _task) = InboundRouter::spawn(handler, 2);

        // The first event is taken by the dispatcher and blocks on the gate.
        router.route(&deliver("1", "2", b"0"));
        while router.pending() > 0 {
            tokio::task::yield_now().await;
        }

        for body in [b"1", b"2", b"3", b"4"] {
            assert_eq!(router.route(&deliver("1", "2", body)), Route::Dispatched);
        }
        assert_eq!(router.dropped(), 2);

        gate.add_permits(10);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![b"0".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }

    #[tokio::test]
    async fn malformed_frames_never_reach_handler() {
        let (tx, mut rx) = mpsc::channel(4);
        let (router, task) = InboundRouter::spawn(Arc::new(ChannelHandler::new(tx)), 4);

        let broken = Frame::new(CommandId::DeliverSm);
        assert_eq!(router.route(&broken), Route::Malformed);

        router.close();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_drains_queued_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let (router, task) = InboundRouter::spawn(Arc::new(ChannelHandler::new(tx)), 8);

        router.route(&deliver("1", "2", b"a"));
        router.route(&deliver("1", "2", b"b"));
        router.close();
        assert_eq!(router.route(&deliver("1", "2", b"c")), Route::Ignored);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().body, b"a");
        assert_eq!(rx.recv().await.unwrap().body, b"b");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn events_racing_close_are_delivered_or_refused() {
        let (tx, mut rx) = mpsc::channel(256);
        let (router, task) = InboundRouter::spawn(Arc::new(ChannelHandler::new(tx)), 256);

        let producer = {
            let router = router.clone();
            std::thread::spawn(move || {
                (0..200u8)
                    .filter(|i| router.route(&deliver("1", "2", &[*i])) == Route::Dispatched)
                    .count()
            })
        };
        tokio::task::yield_now().await;
        router.close();
        let accepted = producer.join().unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        let mut delivered = 0;
        while rx.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, accepted);
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = FnHandler(move |event: InboundEvent| {
            if event.body == b"boom" {
                panic!("handler failure");
            }
            let _ = tx.send(event.body);
        });
        let (router, _task) = InboundRouter::spawn(Arc::new(handler), 4);

        router.route(&deliver("1", "2", b"boom"));
        router.route(&deliver("1", "2", b"ok"));
        assert_eq!(rx.recv().await.unwrap(), b"ok");
    }
}
