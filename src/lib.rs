//! # fcpr - FCP client transfer engine
//!
//! fcpr talks to a node over its text protocol: it encodes and decodes
//! messages, runs one state machine per download ([`client_get`]) or upload
//! ([`client_put`]), and serializes the raw payloads that share the socket
//! with the [`writer_lock`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fcpr::client_get::{Download, GetRequest};
//! use fcpr::connection::TcpConnector;
//! use fcpr::queue::TransferQueue;
//! use fcpr::transfer::Transfer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = TcpConnector::new("127.0.0.1", 9481).open("my-client", true).await?;
//!     let queue = TransferQueue::new("my-client");
//!     let mut request = GetRequest::new("KSK@gpl.txt");
//!     request.destination = Some("/tmp".into());
//!     let download = Download::new(&connection, queue, request).await;
//!     download.start().await?;
//!     Ok(())
//! }
//! ```

pub mod client_get;
pub mod client_put;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod generate_ssk;
pub mod hashing;
pub mod keys;
pub mod logging;
pub mod message;
pub mod queries;
pub mod queue;
pub mod queue_loader;
pub mod status;
pub mod store;
pub mod test_dda;
pub mod transfer;
pub mod writer_lock;

// Re-export commonly used types and functions
pub use client_get::{Download, GetRequest};
pub use client_put::{PutRequest, PutSource, Upload};
pub use config::Config;
pub use connection::{Connection, Connector, SessionOptions, TcpConnector};
pub use error::{FcpError, FcpResult, ParamError};
pub use message::{Message, MessageKind};
pub use status::TransferStatus;
pub use transfer::{Parameters, Persistence, Transfer, TransferKind, TransferSnapshot};

// vim: ts=4
