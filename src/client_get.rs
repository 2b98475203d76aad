//! Download state machine
//!
//! One [`ClientGet`] drives a single fetch: it submits the `ClientGet`
//! request, follows redirects, negotiates direct disk access, and when the
//! node hands the bytes over the socket (`AllData`), writes them to disk
//! while holding the connection's writer lock.
//!
//! The machine lives behind an `Arc<Mutex<_>>` subscribed to the connection
//! dispatcher; [`Download`] is the handle its owner keeps.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, Payload};
use crate::dispatch::{Event, LocalEvent, Registration, Subscriber};
use crate::error::{FcpError, FcpResult, ParamError};
use crate::keys::filename_from_key;
use crate::message::{Message, MessageKind};
use crate::queries;
use crate::queue::QueueHandle;
use crate::status::TransferStatus;
use crate::test_dda::{test_dda, DdaVerdict};
use crate::transfer::{
	Parameters, Persistence, Transfer, TransferKind, TransferQuery, TransferSnapshot, BLOCK_SIZE,
	DEFAULT_PRIORITY,
};
use crate::writer_lock::{PendingLock, WriterPermit};

/// Minimum delay between two progress notifications while writing to disk
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// "Data not found"; too common to be worth logging
const DATA_NOT_FOUND: i32 = 13;

/// Protocol error codes with a dedicated handling
const CODE_INVALID_URI: i32 = 4;
const CODE_NO_SUCH_IDENTIFIER: i32 = 15;
const CODE_DDA_DENIED: i32 = 25;

/// What to fetch, and where to put it
#[derive(Debug, Clone)]
pub struct GetRequest {
	pub key: String,
	pub priority: u8,
	pub persistence: Persistence,
	pub global: bool,
	pub max_retries: i32,
	/// Directory receiving the file
	pub destination: Option<PathBuf>,
	/// Exact target path; wins over `destination`
	pub final_path: Option<PathBuf>,
	/// Refuse files bigger than this; 0 means no limit
	pub max_size: i64,
	/// Never let the node write to disk itself
	pub no_dda: bool,
	/// Fail instead of following `RedirectURI`
	pub no_redirect: bool,
}

impl GetRequest {
	pub fn new(key: impl Into<String>) -> Self {
		GetRequest {
			key: key.into(),
			priority: DEFAULT_PRIORITY,
			persistence: Persistence::Forever,
			global: true,
			max_retries: -1,
			destination: None,
			final_path: None,
			max_size: 0,
			no_dda: false,
			no_redirect: false,
		}
	}
}

/// Where a download stands, beyond its [`TransferStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetPhase {
	Idle,
	Requesting,
	TestingDda,
	Fetching,
	Redirecting,
	WaitingForLock,
	RequestingData,
	Writing,
	AvailableNotDownloaded,
	Done,
}

/// Second session opened to fetch the data of a global request
struct DataSession {
	connection: Connection,
	registration: Registration,
}

pub struct ClientGet {
	uid: Uuid,
	connection: Connection,
	queue: Arc<dyn QueueHandle>,
	registration: Registration,
	publisher: watch::Sender<TransferSnapshot>,
	query: TransferQuery,
	phase: GetPhase,

	key: String,
	filename: Option<String>,
	destination: Option<PathBuf>,
	final_path: Option<PathBuf>,
	file_size: i64,
	max_size: i64,
	got_expected: bool,
	already_saved: bool,
	writing_successful: bool,
	dda_refused: bool,
	no_redirect: bool,
	restart_pending: bool,
	get_failed_code: Option<i32>,
	protocol_error_code: Option<i32>,

	pending_lock: Option<PendingLock>,
	permit: Option<WriterPermit>,
	data_session: Option<DataSession>,
}

/// Name to save a key under: from the key itself, or rebuilt from the
/// identifier pieces following the first dash
fn derive_filename(key: &str, identifier: Option<&str>) -> Option<String> {
	if let Some(name) = filename_from_key(key) {
		return Some(name);
	}
	let pieces: Vec<&str> = identifier?.split('-').collect();
	if pieces.len() < 2 {
		return None;
	}
	Some(pieces[1..].concat())
}

/// File name with the characters most filesystems refuse replaced
fn safe_filename(name: &str) -> String {
	name.chars()
		.map(|c| match c {
			'\\' | '/' | ':' | '"' | '*' | '?' | '<' | '>' | '|' | '\r' | '\n' => '_',
			c => c,
		})
		.collect()
}

fn node_percent(written: u64, expected: u64) -> i32 {
	if expected == 0 {
		return 100;
	}
	((written * 100) / expected).clamp(1, 100) as i32
}

impl ClientGet {
	fn blank(connection: &Connection, queue: Arc<dyn QueueHandle>, key: String, query: TransferQuery) -> Self {
		let (publisher, _) = watch::channel(TransferSnapshot::pending(TransferKind::Download));
		let unbound: Weak<Mutex<ClientGet>> = Weak::new();
		let this: Weak<dyn Subscriber> = unbound;
		ClientGet {
			uid: Uuid::new_v4(),
			connection: connection.clone(),
			queue,
			registration: Registration::new(connection.router().clone(), this),
			publisher,
			query,
			phase: GetPhase::Idle,
			key,
			filename: None,
			destination: None,
			final_path: None,
			file_size: -1,
			max_size: 0,
			got_expected: false,
			already_saved: false,
			writing_successful: false,
			dda_refused: false,
			no_redirect: false,
			restart_pending: false,
			get_failed_code: None,
			protocol_error_code: None,
			pending_lock: None,
			permit: None,
			data_session: None,
		}
	}

	/// Wrap into the shared, dispatcher-subscribed form and publish the
	/// first snapshot
	async fn into_download(self) -> Download {
		let uid = self.uid;
		let watch = self.publisher.subscribe();
		let router = self.connection.router().clone();
		let machine = Arc::new_cyclic(move |weak: &Weak<Mutex<ClientGet>>| {
			let mut get = self;
			let this: Weak<dyn Subscriber> = weak.clone();
			get.registration = Registration::new(router, this);
			Mutex::new(get)
		});
		{
			let mut get = machine.lock().await;
			if let Some(identifier) = get.query.identifier.clone() {
				get.registration.bind(&identifier);
			}
			get.notify();
		}
		Download { uid, machine, watch }
	}

	// ====================================================================
	// Accessors
	// ====================================================================

	pub fn uid(&self) -> Uuid {
		self.uid
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn filename(&self) -> Option<&str> {
		self.filename.as_deref()
	}

	pub fn destination(&self) -> Option<&Path> {
		self.destination.as_deref()
	}

	pub fn phase(&self) -> GetPhase {
		self.phase
	}

	pub fn query(&self) -> &TransferQuery {
		&self.query
	}

	pub fn file_size(&self) -> i64 {
		self.file_size
	}

	pub fn is_dda_refused(&self) -> bool {
		self.dda_refused
	}

	pub fn is_writing_successful(&self) -> bool {
		self.writing_successful
	}

	pub fn get_failed_code(&self) -> Option<i32> {
		self.get_failed_code
	}

	pub fn protocol_error_code(&self) -> Option<i32> {
		self.protocol_error_code
	}

	/// Target file: the final path when set, else destination/filename
	pub fn path(&self) -> Option<PathBuf> {
		if let Some(path) = &self.final_path {
			return Some(path.clone());
		}
		let dir = self.destination.as_ref()?;
		let name = self.filename.as_ref()?;
		Some(dir.join(name.replace('|', "_")))
	}

	/// Key with the file name appended when a bare CHK lacks it
	pub fn file_key(&self) -> String {
		match &self.filename {
			Some(name) if self.key.starts_with("CHK@") && !self.key.contains('/') => {
				format!("{}/{}", self.key, name)
			}
			_ => self.key.clone(),
		}
	}

	pub fn snapshot(&self) -> TransferSnapshot {
		TransferSnapshot {
			kind: TransferKind::Download,
			identifier: self.query.identifier.clone(),
			key: Some(self.key.clone()),
			filename: self.filename.clone(),
			status: self.query.status,
			status_text: self.query.status_text.clone(),
			fatal: self.query.fatal,
			progress: self.query.progress,
			node_progress: self.query.node_progress,
			file_size: self.file_size,
			attempt: self.query.attempt,
			priority: self.query.priority,
			global: self.query.global,
			persistence: self.query.persistence,
		}
	}

	fn notify(&self) {
		self.publisher.send_replace(self.snapshot());
	}

	fn dda_allowed(&self) -> bool {
		self.connection.is_local() && !self.dda_refused
	}

	// ====================================================================
	// Requests
	// ====================================================================

	pub async fn start(&mut self) -> FcpResult<()> {
		self.query.attempt += 1;
		self.query.status = TransferStatus::Running;
		self.query.fatal = true;
		self.send_client_get().await
	}

	async fn send_client_get(&mut self) -> FcpResult<()> {
		if self.final_path.is_none() && self.destination.is_none() {
			let tmp = std::env::temp_dir();
			info!("No destination for '{}', using {}", self.key, tmp.display());
			self.destination = Some(tmp);
		}
		self.phase = GetPhase::Requesting;
		self.query.status_text = "Requesting".to_string();

		let identifier = match &self.query.identifier {
			Some(identifier) => identifier.clone(),
			None => {
				let name = self.filename.as_deref().unwrap_or("nameless");
				let identifier = format!("{}-{}", self.queue.next_id(), name);
				self.query.identifier = Some(identifier.clone());
				identifier
			}
		};
		self.registration.bind(&identifier);

		let mut message = Message::of(MessageKind::ClientGet)
			.with("URI", self.key.as_str())
			.with("Identifier", identifier.as_str())
			.with("Verbosity", "1")
			.with("MaxRetries", self.query.max_retries.to_string())
			.with("PriorityClass", self.query.priority.to_string());
		if self.max_size > 0 {
			message.set("MaxSize", self.max_size.to_string());
		}
		if let Some(dir) = &self.destination {
			message.set("ClientToken", dir.to_string_lossy().to_string());
		}
		message.set("Persistence", self.query.persistence.as_fcp());
		message.set("Global", self.query.global_field());

		match self.path() {
			Some(path) if self.dda_allowed() => {
				message.set("ReturnType", "disk");
				message.set("Filename", path.to_string_lossy().to_string());
			}
			_ => message.set("ReturnType", "direct"),
		}

		debug!("Requesting '{}' as '{}'", self.key, identifier);
		self.notify();
		self.connection.send(&message).await
	}

	/// Ask the node to forget the request. `false` for requests it does not
	/// keep anyway.
	pub async fn remove_request(&mut self) -> FcpResult<bool> {
		if !self.query.is_persistent() {
			warn!("Can't remove non-persistent request '{}'", self.key);
			return Ok(false);
		}
		let Some(identifier) = self.query.identifier.clone() else {
			return Ok(true);
		};
		queries::remove_persistent_request(&self.connection, &identifier, self.query.global).await?;
		self.query.status =
			if self.query.status.is_successful() { TransferStatus::Successful } else { TransferStatus::Failed };
		Ok(true)
	}

	pub async fn pause(&mut self) -> FcpResult<()> {
		self.remove_request().await?;
		if let Some(pending) = self.pending_lock.take() {
			pending.cancel();
		}
		self.query.status = TransferStatus::NotRunning;
		self.query.status_text = "Delayed".to_string();
		self.phase = GetPhase::Idle;
		self.notify();
		Ok(())
	}

	/// Definitive stop; a pending wait for the writer lock is cancelled
	pub async fn stop(&mut self) -> FcpResult<bool> {
		if self.query.is_persistent() && !self.remove_request().await? {
			return Ok(false);
		}
		self.registration.unbind();
		self.release_data_session().await;

		let successful = self.query.status.is_finished() && self.query.status.is_successful();
		self.query.status = if successful { TransferStatus::Successful } else { TransferStatus::Failed };
		self.query.fatal = true;
		self.query.status_text = "Stopped".to_string();
		self.phase = GetPhase::Done;
		self.notify();
		Ok(true)
	}

	pub async fn update_persistent_request(&mut self, client_token: bool) -> FcpResult<()> {
		if !self.query.is_persistent() {
			return Ok(());
		}
		let Some(identifier) = self.query.identifier.clone() else {
			return Ok(());
		};
		let token = if client_token {
			self.destination.as_ref().map(|d| d.to_string_lossy().to_string())
		} else {
			None
		};
		queries::modify_persistent_request(
			&self.connection,
			&identifier,
			self.query.global,
			self.query.priority,
			token.as_deref(),
		)
		.await
	}

	pub fn set_priority(&mut self, priority: u8) {
		self.query.priority = priority;
		self.notify();
	}

	/// Have the node send the data of a persistent request again, once the
	/// writer lock of the session carrying it is ours.
	///
	/// Global requests are fetched over a second session: `AllData` goes
	/// only to the session that asks for it.
	pub fn save_file_to(&mut self, dir: &Path, check_status: bool) -> bool {
		self.query.node_progress = 0;
		self.destination = Some(dir.to_path_buf());

		if check_status && !(self.query.status.is_finished() && self.query.status.is_successful()) {
			warn!("Can't save '{}': the transfer is not finished", self.key);
			return false;
		}
		if !self.query.is_persistent() {
			warn!("Can't save '{}': the request is not persistent", self.key);
			return false;
		}
		let Some(identifier) = self.query.identifier.clone() else {
			warn!("Can't save '{}': no identifier", self.key);
			return false;
		};
		info!("Saving '{}' to {}", self.key, dir.display());

		self.registration.bind(&identifier);
		self.query.status_text = "Waiting for socket availability ...".to_string();
		self.query.node_progress = 1;
		self.query.status = TransferStatus::Running;
		self.phase = GetPhase::WaitingForLock;
		if let Some(previous) = self.pending_lock.take() {
			previous.cancel();
		}

		let source = self.connection.clone();
		let global = self.query.global;
		let suffix = identifier.clone();
		let prepare = async move {
			let session = if global { source.duplicate(&suffix).await? } else { source };
			Ok::<_, FcpError>((session.writer_lock().clone(), session))
		};

		let main = self.connection.clone();
		let key = identifier.clone();
		self.pending_lock = Some(PendingLock::spawn_with(prepare, identifier, move |granted| async move {
			let event = match granted {
				Ok((permit, connection)) => LocalEvent::WriterLockGranted { permit, connection },
				Err(e) => LocalEvent::WriterLockFailed(e.to_string()),
			};
			main.post(&key, event);
		}));
		self.notify();
		true
	}

	/// Drop the writer lock, any pending wait for it, and the second session
	async fn release_data_session(&mut self) {
		if let Some(pending) = self.pending_lock.take() {
			pending.cancel();
		}
		self.permit = None;
		if let Some(mut session) = self.data_session.take() {
			session.registration.unbind();
			session.connection.disconnect().await;
		}
	}

	fn spawn_dda_test(&mut self, dir: PathBuf) {
		let Some(identifier) = self.query.identifier.clone() else {
			return;
		};
		self.phase = GetPhase::TestingDda;
		let connection = self.connection.clone();
		tokio::spawn(async move {
			let verdict = test_dda(&connection, &dir, false, true).await.map_err(|e| e.to_string());
			connection.post(&identifier, LocalEvent::DdaTested(verdict));
		});
	}

	// ====================================================================
	// Event handling
	// ====================================================================

	pub(crate) async fn handle(&mut self, event: Event) {
		match event {
			Event::Message { message, payload } => self.on_message(message, payload).await,
			Event::Local(local) => self.on_local(local).await,
			Event::Disconnected => self.on_disconnected().await,
		}
		self.notify();
	}

	async fn on_message(&mut self, message: Message, payload: Option<Payload>) {
		if message.identifier() != self.query.identifier.as_deref() {
			debug!("Ignoring '{}' for another request", message.name());
			return;
		}

		match message.kind() {
			MessageKind::DataFound => self.on_data_found(&message).await,
			MessageKind::IdentifierCollision => {
				warn!("Identifier collision on '{}'", self.key);
				self.query.identifier = None;
				self.registration.unbind();
				self.restart().await;
			}
			MessageKind::PersistentGet => debug!("PersistentGet for '{}'", self.key),
			MessageKind::ProtocolError => self.on_protocol_error(&message).await,
			MessageKind::PersistentRequestModified => {
				match message.get("PriorityClass").and_then(|p| p.trim().parse().ok()) {
					Some(priority) => self.query.priority = priority,
					None => warn!("PersistentRequestModified without a priority class"),
				}
			}
			MessageKind::PersistentRequestRemoved => {
				info!("Request '{}' removed from the node", self.key);
				self.query.status_text = "Removed".to_string();
				if !self.query.status.is_finished() {
					self.query.status = TransferStatus::Failed;
					self.query.fatal = true;
				}
				self.phase = GetPhase::Done;
				self.registration.unbind();
				self.release_data_session().await;
				self.queue.remove(self.uid);
			}
			MessageKind::GetFailed => self.on_get_failed(&message).await,
			MessageKind::SimpleProgress => self.on_simple_progress(&message),
			MessageKind::AllData => self.on_all_data(&message, payload).await,
			MessageKind::ExpectedDataLength => {
				if let Some(length) = message.get_i64("DataLength") {
					self.file_size = length;
				}
				self.got_expected = true;
			}
			MessageKind::SendingToNetwork
			| MessageKind::ExpectedHashes
			| MessageKind::CompatibilityMode
			| MessageKind::ExpectedMIME => {}
			_ => debug!("Unhandled '{}' for download '{}'", message.name(), self.key),
		}
	}

	async fn restart(&mut self) {
		if let Err(e) = self.start().await {
			error!("Unable to resubmit '{}': {}", self.key, e);
			self.query.fail(format!("Unable to reach the node ({})", e));
			self.phase = GetPhase::Done;
		}
	}

	async fn on_data_found(&mut self, message: &Message) {
		self.query.make_reliable();
		if self.query.status.is_finished() || self.already_saved {
			return;
		}
		self.already_saved = true;
		if let Some(length) = message.get_i64("DataLength") {
			self.file_size = length;
		}

		// otherwise the data follows as AllData on this session
		if !self.query.is_persistent() && !self.dda_allowed() {
			return;
		}

		match self.destination.clone() {
			Some(dir) => {
				let exists = match self.path() {
					Some(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
					None => false,
				};
				if !exists && !self.dda_allowed() && self.connection.auto_download() {
					self.query.status_text = "Requesting file from the node".to_string();
					self.writing_successful = false;
					self.save_file_to(&dir, false);
				} else {
					self.query.status_text = "Available".to_string();
					self.query.status = TransferStatus::Successful;
					self.query.node_progress = 100;
					self.writing_successful = true;
					self.phase = GetPhase::Done;
				}
			}
			None => {
				self.query.status_text = "Available but not downloaded".to_string();
				self.query.status = TransferStatus::Successful;
				self.writing_successful = true;
				self.phase = GetPhase::AvailableNotDownloaded;
			}
		}
	}

	async fn on_protocol_error(&mut self, message: &Message) {
		let code = message.code().unwrap_or(-1);
		let description = message.get("CodeDescription").unwrap_or("?").to_string();

		if code == CODE_DDA_DENIED && self.dda_allowed() {
			let dir = self.destination.clone().or_else(|| {
				self.final_path.as_ref().and_then(|p| p.parent()).map(Path::to_path_buf)
			});
			if let Some(dir) = dir {
				info!("Node asks for a DDA test of {}", dir.display());
				self.spawn_dda_test(dir);
				return;
			}
		}
		let fetching_data = matches!(self.phase, GetPhase::WaitingForLock | GetPhase::RequestingData);
		if code == CODE_NO_SUCH_IDENTIFIER && !fetching_data {
			debug!("Node knows no request '{:?}'", self.query.identifier);
			return;
		}
		if code == CODE_INVALID_URI {
			warn!("Invalid key: {}", self.key);
		}

		error!("Protocol error on '{}': {} ({})", self.key, description, code);
		self.protocol_error_code = Some(code);
		self.query.fail_from(format!("Protocol Error ({})", description), message);
		self.phase = GetPhase::Done;
		self.registration.unbind();
		self.release_data_session().await;
	}

	async fn on_get_failed(&mut self, message: &Message) {
		if let Some(redirect) = message.get("RedirectURI") {
			let redirect = redirect.trim().to_string();
			if redirect == self.key {
				warn!("Node redirects '{}' to itself", self.key);
			} else if !self.no_redirect {
				info!("Redirected: '{}' -> '{}'", self.key, redirect);
				self.key = redirect;
				self.query.status_text = "Redirected ...".to_string();
				self.phase = GetPhase::Redirecting;
				let ours = self.query.identifier.as_deref().map(|id| self.queue.is_ours(id)).unwrap_or(false);
				if ours {
					self.restart_pending = true;
					if let Err(e) = self.stop().await {
						warn!("Unable to withdraw the request before redirecting: {}", e);
					}
					// the next attempt is a new request
					self.query.identifier = None;
				} else {
					info!("Not our request, the node follows the redirect");
				}
			} else {
				info!("Redirect to '{}' ignored", redirect);
			}
		}

		if self.restart_pending {
			self.restart_pending = false;
			self.restart().await;
			return;
		}

		let code = message.code().unwrap_or(-1);
		let description = message.get("CodeDescription").unwrap_or("?").to_string();
		if code != DATA_NOT_FOUND {
			info!("GetFailed on '{}': {} ({})", self.key, description, code);
		}

		if !self.query.status.is_running() {
			info!("Cancellation of '{}' confirmed", self.key);
			return;
		}
		self.registration.unbind();
		self.release_data_session().await;
		self.get_failed_code = Some(code);
		self.query.fail_from(format!("Failed ({})", description), message);
		self.phase = GetPhase::Done;
	}

	fn on_simple_progress(&mut self, message: &Message) {
		let counters = (message.get_i64("Total"), message.get_i64("Required"), message.get_i64("Succeeded"));
		let (Some(total), Some(required), Some(succeeded)) = counters else {
			self.query.set_block_numbers(-1, -1, -1, false);
			return;
		};
		if !self.got_expected {
			self.file_size = required * BLOCK_SIZE;
		}
		let reliable = message.get_bool("FinalizedTotal").unwrap_or(false);
		self.query.set_block_numbers(required, total, succeeded, reliable);

		if !self.query.status.is_finished() {
			self.query.status_text = "Fetching".to_string();
			self.query.status = TransferStatus::Running;
			if matches!(self.phase, GetPhase::Idle | GetPhase::Requesting | GetPhase::Redirecting) {
				self.phase = GetPhase::Fetching;
			}
		}
	}

	async fn on_all_data(&mut self, message: &Message, payload: Option<Payload>) {
		self.got_expected = true;
		self.file_size = message.data_waiting();
		self.query.status = TransferStatus::Running;
		self.query.startup_time = message.get_i64("StartupTime");
		self.query.completion_time = message.get_i64("CompletionTime");
		self.query.status_text = "Writing to disk".to_string();
		self.phase = GetPhase::Writing;
		info!("Receiving '{}' ({} bytes)", self.key, self.file_size);
		self.notify();

		let outcome = match payload {
			Some(payload) => self.fetch_directly(payload).await,
			None => Err("No data after AllData".to_string()),
		};
		match outcome {
			Ok(()) => {
				self.writing_successful = true;
				self.query.node_progress = 100;
				self.query.status_text = "Available".to_string();
				self.query.status = TransferStatus::Successful;
			}
			Err(reason) => {
				self.writing_successful = false;
				self.query.fail(format!("Error while receiving the file ({})", reason));
			}
		}
		self.phase = GetPhase::Done;
		self.registration.unbind();
		self.release_data_session().await;
	}

	/// Target file, falling back to a sanitized name and then to a
	/// temporary file
	async fn create_output_file(&mut self) -> Result<(File, PathBuf), String> {
		let mut candidates = Vec::new();
		if let Some(path) = self.path() {
			if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
				let safe = path.with_file_name(safe_filename(&name));
				candidates.push(path);
				if !candidates.contains(&safe) {
					candidates.push(safe);
				}
			} else {
				candidates.push(path);
			}
		}
		candidates.push(std::env::temp_dir().join(format!("fcpr_{}.tmp", self.uid.simple())));

		let preferred = candidates.first().cloned();
		for candidate in candidates {
			match File::create(&candidate).await {
				Ok(file) => {
					if Some(&candidate) != preferred.as_ref() || self.path().is_none() {
						warn!("Writing '{}' to {}", self.key, candidate.display());
						self.final_path = Some(candidate.clone());
					}
					return Ok((file, candidate));
				}
				Err(e) => warn!("Unable to create {}: {}", candidate.display(), e),
			}
		}
		Err("Write error".to_string())
	}

	/// Stream the payload into the target file. The payload is always
	/// consumed to its end, even on failure.
	async fn fetch_directly(&mut self, mut payload: Payload) -> Result<(), String> {
		let expected = payload.len();
		let (mut file, path) = match self.create_output_file().await {
			Ok(created) => created,
			Err(reason) => {
				let skipped = payload.drain().await;
				debug!("{} bytes drained", skipped);
				return Err(reason);
			}
		};

		let mut written: u64 = 0;
		let mut last_notice = Instant::now();
		while let Some(chunk) = payload.next_chunk().await {
			let data = match chunk {
				Ok(data) => data,
				Err(e) => {
					error!("Unable to read data from the node: {}", e);
					drop(file);
					discard(&path).await;
					return Err("Unable to read data from the node".to_string());
				}
			};
			if let Err(e) = file.write_all(&data).await {
				error!("Unable to write {}: {}", path.display(), e);
				drop(file);
				discard(&path).await;
				payload.drain().await;
				return Err("Unable to fetch / disk probably full !".to_string());
			}
			written += data.len() as u64;

			if last_notice.elapsed() >= PROGRESS_INTERVAL {
				last_notice = Instant::now();
				self.query.node_progress = node_percent(written, expected);
				self.notify();
			}
		}

		if written < expected {
			drop(file);
			discard(&path).await;
			return Err("Unable to read data from the node".to_string());
		}
		if let Err(e) = file.flush().await {
			error!("Unable to flush {}: {}", path.display(), e);
			drop(file);
			discard(&path).await;
			return Err("Unable to fetch / disk probably full !".to_string());
		}
		debug!("{} bytes written to {}", written, path.display());
		Ok(())
	}

	async fn on_local(&mut self, event: LocalEvent) {
		match event {
			LocalEvent::DdaTested(verdict) => self.on_dda_tested(verdict).await,
			LocalEvent::WriterLockGranted { permit, connection } => {
				self.on_writer_lock(permit, connection).await
			}
			LocalEvent::WriterLockFailed(reason) => {
				self.pending_lock = None;
				error!("Unable to get the socket for '{}': {}", self.key, reason);
				self.query.fail(format!("Unable to get the socket ({})", reason));
				self.phase = GetPhase::Done;
			}
			other => debug!("Download ignores {:?}", other),
		}
	}

	async fn on_dda_tested(&mut self, verdict: Result<DdaVerdict, String>) {
		match verdict {
			Ok(verdict) if verdict.write_allowed => {}
			Ok(_) => {
				info!("Node may not write into our directory, it will send the data");
				self.dda_refused = true;
			}
			Err(e) => {
				warn!("DDA test failed: {}", e);
				self.dda_refused = true;
			}
		}
		if let Err(e) = self.send_client_get().await {
			error!("Unable to resubmit '{}': {}", self.key, e);
			self.query.fail(format!("Unable to reach the node ({})", e));
			self.phase = GetPhase::Done;
		}
	}

	async fn on_writer_lock(&mut self, permit: WriterPermit, connection: Connection) {
		self.pending_lock = None;
		let identifier = match (&self.query.identifier, self.phase) {
			(Some(identifier), GetPhase::WaitingForLock) => identifier.clone(),
			_ => {
				debug!("Writer lock for '{}' no longer needed", self.key);
				drop(permit);
				if !connection.same_session(&self.connection) {
					connection.disconnect().await;
				}
				return;
			}
		};

		self.permit = Some(permit);
		if !connection.same_session(&self.connection) {
			let mut registration =
				Registration::new(connection.router().clone(), self.registration.subscriber());
			registration.bind(&identifier);
			self.data_session = Some(DataSession { connection: connection.clone(), registration });
		}
		self.query.status_text = "Requesting file".to_string();
		self.query.status = TransferStatus::Running;
		self.phase = GetPhase::RequestingData;
		self.notify();

		if let Err(e) = queries::get_request_status(&connection, &identifier, self.query.global, true).await {
			error!("Unable to request the data of '{}': {}", self.key, e);
			self.release_data_session().await;
			self.query.fail(format!("Unable to request the file ({})", e));
			self.phase = GetPhase::Done;
		}
	}

	async fn on_disconnected(&mut self) {
		self.release_data_session().await;
		if self.query.status.is_running() {
			warn!("Connection lost while '{}' was running", self.key);
			self.query.status = TransferStatus::Failed;
			self.query.fatal = false;
			self.query.status_text = "Disconnected (non-fatal)".to_string();
			self.phase = GetPhase::Done;
		}
		self.registration.unbind();
	}

	// ====================================================================
	// Persistence
	// ====================================================================

	pub fn parameters(&self) -> Parameters {
		let mut params = Parameters::new();
		params.set("URI", &self.key);
		params.set_opt("Filename", self.filename.as_ref());
		params.set("Priority", self.query.priority);
		params.set("Persistence", self.query.persistence.code());
		params.set("Global", self.query.global);
		params.set_opt("ClientToken", self.destination.as_ref().map(|d| d.to_string_lossy().to_string()));
		params.set("Attempt", self.query.attempt);
		params.set("Status", &self.query.status_text);
		params.set_opt("Identifier", self.query.identifier.as_ref());
		params.set("FileSize", self.file_size);
		params.set("Running", self.query.status.is_running());
		params.set("Successful", self.query.status.is_successful());
		params.set("Finished", self.query.status.is_finished());
		params.set("MaxRetries", self.query.max_retries);
		params
	}
}

async fn discard(path: &Path) {
	if let Err(e) = tokio::fs::remove_file(path).await {
		debug!("Unable to remove {}: {}", path.display(), e);
	}
}

#[async_trait]
impl Subscriber for Mutex<ClientGet> {
	async fn on_event(&self, event: Event) {
		self.lock().await.handle(event).await;
	}
}

/// Owner's handle on a download
#[derive(Clone)]
pub struct Download {
	uid: Uuid,
	machine: Arc<Mutex<ClientGet>>,
	watch: watch::Receiver<TransferSnapshot>,
}

impl Download {
	/// A fresh request; nothing is sent before [`Transfer::start`]
	pub async fn new(connection: &Connection, queue: Arc<dyn QueueHandle>, request: GetRequest) -> Download {
		let query = TransferQuery::new(request.priority, request.persistence, request.global);
		let mut get = ClientGet::blank(connection, queue, request.key, query);
		get.query.max_retries = request.max_retries;
		get.filename = derive_filename(&get.key, None);
		get.destination = request.destination;
		get.final_path = request.final_path;
		get.max_size = request.max_size;
		get.dda_refused = request.no_dda;
		get.no_redirect = request.no_redirect;
		get.into_download().await
	}

	/// A request the node reported with `PersistentGet`
	pub async fn from_persistent_get(
		connection: &Connection,
		queue: Arc<dyn QueueHandle>,
		message: &Message,
	) -> FcpResult<Download> {
		let identifier = message.identifier().ok_or_else(|| ParamError::Missing("Identifier".into()))?.to_string();
		let key = message.get("URI").ok_or_else(|| ParamError::Missing("URI".into()))?.replacen("freenet:", "", 1);
		let priority = match message.get("PriorityClass") {
			Some(raw) => raw.trim().parse().map_err(|_| ParamError::Invalid {
				field: "PriorityClass".into(),
				value: raw.to_string(),
			})?,
			None => DEFAULT_PRIORITY,
		};
		let persistence = Persistence::from_fcp(message.get("PersistenceType").unwrap_or("forever"));
		let global = message.get("Global").map(|g| !g.trim().eq_ignore_ascii_case("false")).unwrap_or(true);

		let ours = queue.is_ours(&identifier);
		let mut get = ClientGet::blank(connection, queue, key, TransferQuery::new(priority, persistence, global));
		get.filename = derive_filename(&get.key, Some(&identifier));
		if ours {
			get.destination = message.get("ClientToken").filter(|t| !t.is_empty()).map(PathBuf::from);
		}
		get.query.identifier = Some(identifier);
		get.query.max_retries = message.get_i64("MaxRetries").map(|r| r as i32).unwrap_or(-1);
		get.query.status = TransferStatus::Running;
		get.query.status_text = "Fetching".to_string();
		get.query.attempt = -1;
		get.phase = GetPhase::Fetching;
		Ok(get.into_download().await)
	}

	/// Rebuild from [`Transfer::parameters`]
	pub async fn from_parameters(
		connection: &Connection,
		queue: Arc<dyn QueueHandle>,
		params: &Parameters,
	) -> FcpResult<Download> {
		let key = params.required("URI")?.to_string();
		let priority: u8 = params.parse("Priority")?;
		let code: i32 = params.parse("Persistence")?;
		let persistence = Persistence::from_code(code)
			.ok_or_else(|| ParamError::Invalid { field: "Persistence".into(), value: code.to_string() })?;
		let global = params.flag("Global")?;
		let running = params.flag("Running")?;
		let successful = params.flag("Successful")?;
		let finished = match params.get("Finished") {
			Some(_) => params.flag("Finished")?,
			None => !running,
		};

		let mut get = ClientGet::blank(connection, queue, key, TransferQuery::new(priority, persistence, global));
		get.filename = params.get("Filename").filter(|f| !f.is_empty()).map(str::to_string);
		get.destination = params.get("ClientToken").filter(|t| !t.is_empty()).map(PathBuf::from);
		get.query.identifier = params.get("Identifier").filter(|i| !i.is_empty()).map(str::to_string);
		get.query.attempt = params.parse("Attempt")?;
		get.query.max_retries = params.parse("MaxRetries")?;
		get.file_size = params.parse("FileSize")?;
		get.query.status = TransferStatus::from_flags(running, finished, successful);
		get.query.status_text = params.get("Status").unwrap_or("Waiting").to_string();

		if persistence == Persistence::UntilDisconnect && !get.query.status.is_finished() {
			get.query.status = TransferStatus::NotRunning;
			get.query.status_text = "Waiting".to_string();
			get.query.identifier = None;
		}
		if get.filename.is_none() {
			get.filename = derive_filename(&get.key, get.query.identifier.as_deref());
		}
		get.phase = match get.query.status {
			TransferStatus::NotRunning => GetPhase::Idle,
			TransferStatus::Running => GetPhase::Fetching,
			_ => GetPhase::Done,
		};
		Ok(get.into_download().await)
	}

	/// Direct access to the machine, for inspection
	pub async fn lock(&self) -> MutexGuard<'_, ClientGet> {
		self.machine.lock().await
	}
}

#[async_trait]
impl Transfer for Download {
	fn uid(&self) -> Uuid {
		self.uid
	}

	fn kind(&self) -> TransferKind {
		TransferKind::Download
	}

	fn snapshot(&self) -> TransferSnapshot {
		self.watch.borrow().clone()
	}

	fn watch(&self) -> watch::Receiver<TransferSnapshot> {
		self.watch.clone()
	}

	async fn start(&self) -> FcpResult<()> {
		self.machine.lock().await.start().await
	}

	async fn stop(&self) -> FcpResult<bool> {
		self.machine.lock().await.stop().await
	}

	async fn pause(&self) -> FcpResult<()> {
		self.machine.lock().await.pause().await
	}

	async fn remove_request(&self) -> FcpResult<bool> {
		self.machine.lock().await.remove_request().await
	}

	async fn update_persistent_request(&self, client_token: bool) -> FcpResult<()> {
		self.machine.lock().await.update_persistent_request(client_token).await
	}

	async fn set_priority(&self, priority: u8) {
		self.machine.lock().await.set_priority(priority);
	}

	async fn save_file_to(&self, dir: &Path) -> FcpResult<bool> {
		let mut get = self.machine.lock().await;
		if !get.query.is_persistent() {
			return Err(FcpError::InvalidState { message: "only persistent downloads can be saved".into() });
		}
		Ok(get.save_file_to(dir, true))
	}

	async fn parameters(&self) -> Parameters {
		self.machine.lock().await.parameters()
	}
}


// vim: ts=4
