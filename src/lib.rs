//! # SMS Gateway
//!
//! Keeps one persistent, authenticated SMPP session to a service provider, forwards
//! submissions over it under a shared rate limit and routes inbound messages to a
//! local handler.
//!
//! ## Features
//!
//! - **Session lifecycle**: bind, automatic rebind with configurable backoff, graceful unbind
//! - **Status fan-out**: any number of observers, bounded per-subscriber buffers
//! - **Rate limiting**: token bucket shared by every submitter
//! - **Inbound routing**: non-blocking dispatch with a bounded drop-oldest queue
//! - **Keep-alive**: periodic enquire_link to detect dead links
//! - **Configuration**: layered files plus environment variables
//! - **Observability**: structured logging through `tracing`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sms_gateway::prelude::*;
//! use sms_loopback::LoopbackSmsc;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let smsc = LoopbackSmsc::new();
//!     let config = SessionConfig::new(
//!         "127.0.0.1:2775",
//!         Credentials::new("system_id", "password"),
//!         BindMode::Transceiver,
//!     );
//!     let session = SessionManager::new(config, Arc::new(smsc), Arc::new(LoggingHandler))?;
//!
//!     let mut status = session.bind()?;
//!     while let Some(event) = status.next_status().await {
//!         if event.state == ConnectionState::Connected {
//!             break;
//!         }
//!     }
//!
//!     let sent = session
//!         .submit(&OutboundMessage::ucs2("6791", "996771977377", "hello"))
//!         .await?;
//!     println!("Message ID: {}", sent.message_id);
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! use sms_gateway::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Rate limit: {} msg/s, burst {}",
//!          config.rate_limit.requests_per_second,
//!          config.rate_limit.burst_size);
//! ```

pub mod config;
pub mod monitor;
pub mod rate_limiter;
pub mod router;
pub mod session;

pub use crate::config::*;

/// Common imports for gateway usage
pub mod prelude {
    pub use crate::config::{AppConfig, LoggingConfig, RebindConfig, ServerConfig, SmppConfig};
    pub use crate::monitor::{ConnectionMonitor, StatusEvent, StatusStream};
    pub use crate::rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
    pub use crate::router::{ChannelHandler, FnHandler, InboundRouter, LoggingHandler, Route};
    pub use crate::session::{RebindPolicy, SessionConfig, SessionError, SessionManager};
    pub use sms_core::*;
}
