//! # SMS Core
//!
//! Core traits and types shared by the SMPP gateway crates.
//!
//! This crate provides the fundamental building blocks for a gateway session:
//! - [`Connector`] / [`Connection`] traits, the narrow seam to the transport
//! - [`InboundHandler`] trait for consuming inbound messages
//! - Common types for submissions, inbound events, lifecycle status and errors
//!
//! ## Example
//!
//! ```rust,ignore
//! use sms_core::{OutboundMessage, DataCoding};
//!
//! let msg = OutboundMessage::ucs2("6791", "996771977377", "hello")
//!     .with_delivery_receipt(true);
//! assert_eq!(msg.coding, DataCoding::Ucs2);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Errors raised by a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Remote address could not be reached
    #[error("address unreachable: {0}")]
    Unreachable(String),
    /// Remote refused the bind (bad credentials, throttled, ...)
    #[error("bind rejected: {0}")]
    BindRejected(String),
    /// Read or write failed on an established link
    #[error("i/o error: {0}")]
    Io(String),
    /// Remote end closed the session
    #[error("remote closed the session")]
    RemoteClosed,
    /// Operation did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Session was closed locally
    #[error("session closed")]
    Closed,
}

/// Errors returned to callers of `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Session is not in the connected state
    #[error("not connected to SMPP gateway")]
    NotConnected,
    /// Rate limiter refused admission
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// Transport failed while handing over the message
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Invalid request parameters
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Inbound frame could not be turned into an [`InboundEvent`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("missing field: {0}")]
    MissingField(Field),
    #[error("field {0} is not a valid address")]
    InvalidAddress(Field),
}

/// Which directions a bind is allowed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Receiver,
    Transmitter,
    Transceiver,
}

impl BindMode {
    pub fn can_submit(self) -> bool {
        matches!(self, BindMode::Transmitter | BindMode::Transceiver)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, BindMode::Receiver | BindMode::Transceiver)
    }
}

/// Identity presented during bind.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub system_id: String,
    pub password: String,
    /// Optional ESME system type, empty when unused.
    #[serde(default)]
    pub system_type: String,
}

impl Credentials {
    pub fn new<S: Into<String>>(system_id: S, password: S) -> Self {
        Self {
            system_id: system_id.into(),
            password: password.into(),
            system_type: String::new(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("system_id", &self.system_id)
            .field("password", &"<redacted>")
            .field("system_type", &self.system_type)
            .finish()
    }
}

/// Lifecycle state of a gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    BindFailed,
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting)
            | (Connecting, Connected)
            | (Connecting, BindFailed)
            | (Connected, Disconnected)
            | (Disconnected, Connecting)
            | (BindFailed, Connecting) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::BindFailed => "Bind failed",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// One lifecycle transition as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub timestamp: OffsetDateTime,
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            timestamp: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    pub fn with_error(state: ConnectionState, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(state)
        }
    }
}

/// SMPP `data_coding` values understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataCoding {
    /// SMSC default alphabet
    #[default]
    Default,
    Latin1,
    Binary,
    Ucs2,
}

impl DataCoding {
    pub fn as_u8(self) -> u8 {
        match self {
            DataCoding::Default => 0x00,
            DataCoding::Latin1 => 0x03,
            DataCoding::Binary => 0x04,
            DataCoding::Ucs2 => 0x08,
        }
    }

    /// Unknown codings are treated as opaque binary.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DataCoding::Default,
            0x03 => DataCoding::Latin1,
            0x08 => DataCoding::Ucs2,
            _ => DataCoding::Binary,
        }
    }
}

/// PDU command identifiers the gateway cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandId {
    GenericNack,
    SubmitSm,
    SubmitSmResp,
    DeliverSm,
    DeliverSmResp,
    Unbind,
    UnbindResp,
    EnquireLink,
    EnquireLinkResp,
    DataSm,
    DataSmResp,
    Other(u32),
}

/// PDU body fields carried in a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    SourceAddr,
    DestinationAddr,
    EsmClass,
    RegisteredDelivery,
    DataCoding,
    ShortMessage,
    MessagePayload,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::SourceAddr => "source_addr",
            Field::DestinationAddr => "destination_addr",
            Field::EsmClass => "esm_class",
            Field::RegisteredDelivery => "registered_delivery",
            Field::DataCoding => "data_coding",
            Field::ShortMessage => "short_message",
            Field::MessagePayload => "message_payload",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `esm_class` bit marking a deliver_sm as an SMSC delivery receipt.
pub const ESM_CLASS_DELIVERY_RECEIPT: u8 = 0x04;

/// `registered_delivery` value requesting a final delivery receipt.
pub const FINAL_DELIVERY_RECEIPT: u8 = 0x01;

/// One already-decoded protocol message. The wire encoding belongs to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub command: CommandId,
    pub sequence: u32,
    pub fields: BTreeMap<Field, Vec<u8>>,
}

impl Frame {
    pub fn new(command: CommandId) -> Self {
        Self {
            command,
            sequence: 0,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_field(mut self, field: Field, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(field, value.into());
        self
    }

    pub fn field(&self, field: Field) -> Option<&[u8]> {
        self.fields.get(&field).map(Vec::as_slice)
    }

    pub fn require(&self, field: Field) -> Result<&[u8], FrameError> {
        self.field(field).ok_or(FrameError::MissingField(field))
    }

    /// Single-octet field, `0` when absent or empty.
    pub fn octet(&self, field: Field) -> u8 {
        self.field(field)
            .and_then(|v| v.first().copied())
            .unwrap_or_default()
    }
}

/// Message handed to the gateway for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub source: String,
    pub destination: String,
    /// Already encoded according to `coding`.
    pub body: Vec<u8>,
    pub coding: DataCoding,
    pub register_delivery: bool,
}

impl OutboundMessage {
    pub fn new<S: Into<String>>(source: S, destination: S, body: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            body: body.into(),
            coding: DataCoding::Default,
            register_delivery: false,
        }
    }

    /// Encode `text` as big-endian UCS-2.
    pub fn ucs2<S: Into<String>>(source: S, destination: S, text: &str) -> Self {
        let body = text
            .encode_utf16()
            .flat_map(|unit| unit.to_be_bytes())
            .collect::<Vec<u8>>();
        Self {
            coding: DataCoding::Ucs2,
            ..Self::new(source, destination, body)
        }
    }

    pub fn with_coding(mut self, coding: DataCoding) -> Self {
        self.coding = coding;
        self
    }

    pub fn with_delivery_receipt(mut self, register: bool) -> Self {
        self.register_delivery = register;
        self
    }

    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.destination.trim().is_empty() {
            return Err(SubmitError::Invalid("destination address is empty".into()));
        }
        if self.coding == DataCoding::Ucs2 && self.body.len() % 2 != 0 {
            return Err(SubmitError::Invalid(
                "UCS-2 body must have an even number of octets".into(),
            ));
        }
        Ok(())
    }

    /// Build the submit_sm frame. Bodies over 254 octets travel in `message_payload`.
    pub fn to_frame(&self) -> Frame {
        let body_field = if self.body.len() > MAX_SHORT_MESSAGE_LEN {
            Field::MessagePayload
        } else {
            Field::ShortMessage
        };
        let registered = if self.register_delivery {
            FINAL_DELIVERY_RECEIPT
        } else {
            0
        };
        Frame::new(CommandId::SubmitSm)
            .with_field(Field::SourceAddr, self.source.as_bytes())
            .with_field(Field::DestinationAddr, self.destination.as_bytes())
            .with_field(Field::DataCoding, [self.coding.as_u8()])
            .with_field(Field::RegisteredDelivery, [registered])
            .with_field(body_field, self.body.clone())
    }
}

/// Largest body that fits into `short_message`.
pub const MAX_SHORT_MESSAGE_LEN: usize = 254;

/// Successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Provider-assigned message id
    pub message_id: String,
}

pub type SubmissionResult = Result<SubmitResponse, SubmitError>;

/// Kind of inbound message delivered to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    /// SMSC report on a previously submitted message
    DeliveryReceipt,
    /// Mobile originated short message
    MobileOriginated,
}

/// Normalized inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: InboundKind,
    pub source: String,
    pub destination: String,
    pub body: Vec<u8>,
    pub coding: DataCoding,
}

impl InboundEvent {
    /// Best-effort text rendering of the body, for logs.
    pub fn text(&self) -> Cow<'_, str> {
        match self.coding {
            DataCoding::Ucs2 => {
                let units = self
                    .body
                    .chunks(2)
                    .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or_default()]))
                    .collect::<Vec<u16>>();
                Cow::Owned(String::from_utf16_lossy(&units))
            }
            DataCoding::Latin1 => Cow::Owned(self.body.iter().map(|&b| b as char).collect()),
            _ => String::from_utf8_lossy(&self.body),
        }
    }
}

/// Factory for transport connections. One call performs one bind handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        mode: BindMode,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A bound transport session.
///
/// `receive` must be cancel-safe: the gateway drops the future when it needs
/// to shut the read loop down.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a frame and wait for the remote acknowledgement. Returns the ack id
    /// (the message id for submit_sm, empty otherwise).
    async fn send(&self, frame: Frame) -> Result<String, TransportError>;
    /// Wait for the next inbound frame.
    async fn receive(&self) -> Result<Frame, TransportError>;
    /// Unbind and release the link.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Consumer of inbound messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent);
}

/// Anything that accepts submissions on behalf of a front end.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, message: &OutboundMessage) -> SubmissionResult;
    /// Current lifecycle state, for readiness checks.
    fn state(&self) -> ConnectionState;
}

/// Utility to create a pseudo id if a provider doesn't return one.
pub fn fallback_id() -> String {
    Uuid::new_v4().to_string()
}
