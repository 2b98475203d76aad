//! Shared transfer model
//!
//! [`TransferQuery`] holds the state every download and upload carries;
//! [`Transfer`] is the owner-facing handle trait the queue works with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{FcpResult, ParamError};
use crate::message::Message;
use crate::status::TransferStatus;

/// Default priority class (lower is more urgent)
pub const DEFAULT_PRIORITY: u8 = 4;

/// Least urgent priority class the node accepts
pub const MAX_PRIORITY: u8 = 6;

/// Size of one network block
pub const BLOCK_SIZE: i64 = 32768;

/// How long the node keeps a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Persistence {
	#[default]
	#[serde(rename = "forever")]
	Forever,
	#[serde(rename = "reboot")]
	UntilNodeReboot,
	#[serde(rename = "connection")]
	UntilDisconnect,
}

impl Persistence {
	/// Value of the `Persistence` message field
	pub fn as_fcp(&self) -> &'static str {
		match self {
			Persistence::Forever => "forever",
			Persistence::UntilNodeReboot => "reboot",
			Persistence::UntilDisconnect => "connection",
		}
	}

	/// Parse a `Persistence`/`PersistenceType` field; unknown values mean forever
	pub fn from_fcp(value: &str) -> Persistence {
		match value.trim() {
			"reboot" => Persistence::UntilNodeReboot,
			"connection" => Persistence::UntilDisconnect,
			_ => Persistence::Forever,
		}
	}

	/// Numeric code used in persisted parameters
	pub fn code(&self) -> i32 {
		match self {
			Persistence::Forever => 0,
			Persistence::UntilNodeReboot => 1,
			Persistence::UntilDisconnect => 2,
		}
	}

	pub fn from_code(code: i32) -> Option<Persistence> {
		match code {
			0 => Some(Persistence::Forever),
			1 => Some(Persistence::UntilNodeReboot),
			2 => Some(Persistence::UntilDisconnect),
			_ => None,
		}
	}

	/// The node keeps the request beyond our connection
	pub fn is_persistent(&self) -> bool {
		!matches!(self, Persistence::UntilDisconnect)
	}
}

impl fmt::Display for Persistence {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_fcp())
	}
}

/// Network block counters; -1 means unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockProgress {
	pub required: i64,
	pub total: i64,
	pub succeeded: i64,
	/// The total will not grow anymore
	pub reliable: bool,
}

impl BlockProgress {
	pub fn unknown(reliable: bool) -> Self {
		BlockProgress { required: -1, total: -1, succeeded: -1, reliable }
	}

	/// Share of required blocks fetched/inserted, when known
	pub fn percent(&self) -> Option<i32> {
		if self.required <= 0 || self.succeeded < 0 {
			return None;
		}
		Some(((self.succeeded * 100) / self.required).min(100) as i32)
	}
}

impl Default for BlockProgress {
	fn default() -> Self {
		Self::unknown(false)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
	Download,
	Upload,
}

/// Observable view of a transfer, published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
	pub kind: TransferKind,
	pub identifier: Option<String>,
	/// Fetched key for downloads, public key for uploads
	pub key: Option<String>,
	pub filename: Option<String>,
	pub status: TransferStatus,
	pub status_text: String,
	pub fatal: bool,
	pub progress: BlockProgress,
	/// Raw transfer with the node, in percent; -1 before it starts
	pub node_progress: i32,
	pub file_size: i64,
	pub attempt: i32,
	pub priority: u8,
	pub global: bool,
	pub persistence: Persistence,
}

impl TransferSnapshot {
	/// Placeholder published before the first real state
	pub fn pending(kind: TransferKind) -> Self {
		TransferSnapshot {
			kind,
			identifier: None,
			key: None,
			filename: None,
			status: TransferStatus::NotRunning,
			status_text: String::new(),
			fatal: true,
			progress: BlockProgress::default(),
			node_progress: -1,
			file_size: -1,
			attempt: 0,
			priority: DEFAULT_PRIORITY,
			global: false,
			persistence: Persistence::default(),
		}
	}

	/// Failed and not worth retrying
	pub fn is_fatally_failed(&self) -> bool {
		self.status.is_finished() && !self.status.is_successful() && self.fatal
	}

	/// Progress on the network side, in percent
	pub fn network_progress(&self) -> Option<i32> {
		self.progress.percent()
	}
}

/// State shared by downloads and uploads
#[derive(Debug)]
pub struct TransferQuery {
	pub identifier: Option<String>,
	pub priority: u8,
	pub persistence: Persistence,
	pub global: bool,
	pub progress: BlockProgress,
	pub status: TransferStatus,
	pub status_text: String,
	pub fatal: bool,
	pub attempt: i32,
	pub max_retries: i32,
	pub node_progress: i32,
	pub startup_time: Option<i64>,
	pub completion_time: Option<i64>,
}

impl TransferQuery {
	/// The global queue is refused by the node for connection-bound requests
	pub fn new(priority: u8, persistence: Persistence, global: bool) -> Self {
		TransferQuery {
			identifier: None,
			priority,
			persistence,
			global: global && persistence.is_persistent(),
			progress: BlockProgress::default(),
			status: TransferStatus::NotRunning,
			status_text: "Waiting".to_string(),
			fatal: true,
			attempt: 0,
			max_retries: -1,
			node_progress: -1,
			startup_time: None,
			completion_time: None,
		}
	}

	pub fn is_persistent(&self) -> bool {
		self.persistence.is_persistent()
	}

	pub fn set_block_numbers(&mut self, required: i64, total: i64, succeeded: i64, reliable: bool) {
		self.progress = BlockProgress { required, total, succeeded, reliable };
	}

	pub fn make_reliable(&mut self) {
		self.progress.reliable = true;
	}

	/// Record a node-reported failure; `Fatal=false` keeps it retryable
	pub fn fail_from(&mut self, text: String, message: &Message) {
		self.status = TransferStatus::Failed;
		self.fatal = message.is_fatal();
		self.status_text = if self.fatal { text } else { format!("{} (non-fatal)", text) };
	}

	/// Record a local failure
	pub fn fail(&mut self, text: impl Into<String>) {
		self.status = TransferStatus::Failed;
		self.fatal = true;
		self.status_text = text.into();
	}

	/// `Global` field value
	pub fn global_field(&self) -> &'static str {
		if self.global {
			"true"
		} else {
			"false"
		}
	}
}

/// Parameter map persisted for each transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&mut self, key: &str, value: impl ToString) {
		self.0.insert(key.to_string(), value.to_string());
	}

	pub fn set_opt<V: ToString>(&mut self, key: &str, value: Option<V>) {
		if let Some(value) = value {
			self.set(key, value);
		}
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(|v| v.as_str())
	}

	/// Present and non-empty
	pub fn required(&self, key: &str) -> Result<&str, ParamError> {
		match self.get(key) {
			Some(v) if !v.is_empty() => Ok(v),
			_ => Err(ParamError::Missing(key.to_string())),
		}
	}

	/// Required field parsed as `T`
	pub fn parse<T: FromStr>(&self, key: &str) -> Result<T, ParamError> {
		let raw = self.required(key)?;
		raw.trim()
			.parse()
			.map_err(|_| ParamError::Invalid { field: key.to_string(), value: raw.to_string() })
	}

	/// Optional field parsed as `T`, `default` when absent
	pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ParamError> {
		match self.get(key) {
			None | Some("") => Ok(default),
			Some(_) => self.parse(key),
		}
	}

	/// Boolean field; absent means false
	pub fn flag(&self, key: &str) -> Result<bool, ParamError> {
		match self.get(key).map(str::trim) {
			None | Some("") => Ok(false),
			Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
			Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
			Some(v) => Err(ParamError::Invalid { field: key.to_string(), value: v.to_string() }),
		}
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
		self.0.iter()
	}
}

impl FromIterator<(String, String)> for Parameters {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		Parameters(iter.into_iter().collect())
	}
}

/// Owner-facing handle of a download or an upload
#[async_trait]
pub trait Transfer: Send + Sync {
	/// Stable handle id (identifiers change across restarts)
	fn uid(&self) -> Uuid;

	fn kind(&self) -> TransferKind;

	/// Latest published state
	fn snapshot(&self) -> TransferSnapshot;

	/// Follow state changes
	fn watch(&self) -> watch::Receiver<TransferSnapshot>;

	/// Submit (or resubmit) the request to the node
	async fn start(&self) -> FcpResult<()>;

	/// Definitive stop. `Ok(false)` when it cannot be stopped right now.
	async fn stop(&self) -> FcpResult<bool>;

	/// Withdraw the request from the node but keep the transfer queued
	async fn pause(&self) -> FcpResult<()>;

	/// Ask the node to forget a persistent request
	async fn remove_request(&self) -> FcpResult<bool>;

	/// Push the local priority (and optionally the client token) to the node
	async fn update_persistent_request(&self, client_token: bool) -> FcpResult<()>;

	async fn set_priority(&self, priority: u8);

	/// Fetch a finished persistent download into `dir`; uploads refuse
	async fn save_file_to(&self, dir: &Path) -> FcpResult<bool>;

	/// Everything needed to rebuild an equivalent transfer
	async fn parameters(&self) -> Parameters;
}


// vim: ts=4
