//! # smtp-delivery
//!
//! An outbound mail delivery engine with:
//! - A message queue with retry, exponential backoff and an external-queue mode
//! - SMTP server endpoints (STARTTLS, implicit TLS, AUTH PLAIN / LOGIN /
//!   CRAM-MD5 / DIGEST-MD5) and local MTA process endpoints
//! - Failover and round-robin load balancing with idle-session reuse
//! - Callbacks for every delivery event
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smtp_delivery::{Manager, NoopCallbacks, Reactor, TcpEndpointConfig, TlsMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new(Reactor::current()?, Arc::new(NoopCallbacks))?;
//!
//!     manager.add_endpoint_tcp(
//!         TcpEndpointConfig::builder("smtp.example.com")
//!             .port(587)
//!             .tls(TlsMode::StartTls)
//!             .credentials("user@example.com", "password")
//!             .max_sessions(4)
//!             .build()?,
//!     )?;
//!
//!     manager.queue_message(
//!         "From: sender@example.com\r\nTo: recipient@example.com\r\nSubject: Hello\r\n\r\nHi!\r\n",
//!     )?;
//!     manager.resume();
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod auth;
pub mod protocol;

// Transport and runtime
pub mod reactor;
pub mod transport;

// Delivery engine
pub mod callbacks;
pub mod endpoint;
pub mod flow;
pub mod manager;
pub mod queue;
pub mod session;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use callbacks::{DeliveryCallbacks, NoopCallbacks};
pub use config::{
    DeliveryConfig, LoadBalanceMode, ProcessEndpointConfig, RetryConfig, TcpEndpointConfig,
    Timeouts, TlsConfig, TlsMode,
};
pub use errors::{FailureClass, SmtpError, SmtpErrorKind, SmtpResult};
pub use manager::{Manager, ManagerBuilder, Status};
pub use observability::MetricsSnapshot;
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use reactor::Reactor;
pub use transport::{Connector, TokioConnector};
pub use types::{Address, Email, EmailBuilder, Envelope, Message};
