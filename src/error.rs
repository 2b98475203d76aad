//! Error types for fcpr operations

use std::io;
use thiserror::Error;

/// Main error type for protocol and transfer operations
#[derive(Debug, Error)]
pub enum FcpError {
	/// I/O error on the socket or on a local file
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// The node closed the connection (or the dispatcher is gone)
	#[error("Connection disconnected")]
	Disconnected,

	/// ClientHello / NodeHello exchange failed
	#[error("Handshake failed: {message}")]
	Handshake { message: String },

	/// Node answered with a ProtocolError
	#[error("Protocol error {code} ({description}){}", non_fatal_suffix(.fatal))]
	Protocol { code: i32, description: String, fatal: bool },

	/// A reply was not the one the exchange expected
	#[error("Unexpected message: {name}")]
	UnexpectedMessage { name: String },

	/// Operation not allowed in the current transfer state
	#[error("Invalid state: {message}")]
	InvalidState { message: String },

	/// Persisted parameters could not be turned back into a transfer
	#[error("Invalid parameters: {0}")]
	Parameter(#[from] ParamError),

	/// Invalid configuration
	#[error("Invalid configuration: {message}")]
	Config { message: String },

	/// Queue store failure
	#[error("Queue store error: {message}")]
	Store { message: String },
}

fn non_fatal_suffix(fatal: &bool) -> &'static str {
	if *fatal {
		""
	} else {
		" (non-fatal)"
	}
}

impl From<redb::Error> for FcpError {
	fn from(e: redb::Error) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

impl From<redb::DatabaseError> for FcpError {
	fn from(e: redb::DatabaseError) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

impl From<redb::TransactionError> for FcpError {
	fn from(e: redb::TransactionError) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

impl From<redb::TableError> for FcpError {
	fn from(e: redb::TableError) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

impl From<redb::StorageError> for FcpError {
	fn from(e: redb::StorageError) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

impl From<redb::CommitError> for FcpError {
	fn from(e: redb::CommitError) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

impl From<serde_json::Error> for FcpError {
	fn from(e: serde_json::Error) -> Self {
		FcpError::Store { message: e.to_string() }
	}
}

/// Errors raised while rebuilding a transfer from a parameter map
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
	/// A required field is absent
	#[error("missing field '{0}'")]
	Missing(String),

	/// A field is present but cannot be parsed
	#[error("invalid value '{value}' for field '{field}'")]
	Invalid { field: String, value: String },
}

/// Result alias used across the crate
pub type FcpResult<T> = Result<T, FcpError>;


// vim: ts=4
