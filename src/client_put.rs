//! Upload state machine
//!
//! A [`ClientPut`] goes through up to three background steps before the node
//! sees the request: hashing the file (local node, upload from disk),
//! generating a keypair (SSK/USK without private key), and waiting for the
//! writer lock. Each step reports back as a local event on the dispatcher, so
//! handlers never block on the node.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{write_message, Connection, PACKET_SIZE};
use crate::dispatch::{Event, LocalEvent, Registration, Subscriber};
use crate::error::{FcpError, FcpResult, ParamError};
use crate::generate_ssk::{generate_ssk, SskKeypair};
use crate::hashing::{file_hash_salt, hash_file};
use crate::keys::KeyType;
use crate::message::{Message, MessageKind};
use crate::queries;
use crate::queue::QueueHandle;
use crate::status::TransferStatus;
use crate::transfer::{
	Parameters, Persistence, Transfer, TransferKind, TransferQuery, TransferSnapshot, DEFAULT_PRIORITY,
};
use crate::writer_lock::PendingLock;

/// Minimum delay between two progress notifications while sending
pub const SEND_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// `PutFailed` code of an insert colliding with different data
const CODE_COLLISION: i32 = 9;

/// Where the bytes come from
#[derive(Debug, Clone)]
pub enum PutSource {
	File(PathBuf),
	Bytes { name: String, data: Arc<Vec<u8>> },
}

impl PutSource {
	/// Name announced as `TargetFilename`
	pub fn target_name(&self) -> String {
		match self {
			PutSource::File(path) => {
				path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
			}
			PutSource::Bytes { name, .. } => name.clone(),
		}
	}

	pub fn local_file(&self) -> Option<&Path> {
		match self {
			PutSource::File(path) => Some(path),
			PutSource::Bytes { .. } => None,
		}
	}

	/// Size to send; `None` when the file cannot be read
	async fn size(&self) -> Option<i64> {
		match self {
			PutSource::File(path) => {
				let meta = tokio::fs::metadata(path).await.ok()?;
				meta.is_file().then_some(meta.len() as i64)
			}
			PutSource::Bytes { data, .. } => Some(data.len() as i64),
		}
	}
}

/// What to insert, and under which key
#[derive(Debug, Clone)]
pub struct PutRequest {
	pub source: PutSource,
	pub key_type: KeyType,
	/// -1 for none
	pub revision: i64,
	/// Name part of KSK/SSK/USK keys; the file name when absent
	pub name: Option<String>,
	pub private_key: Option<String>,
	pub public_key: Option<String>,
	pub priority: u8,
	pub persistence: Persistence,
	pub global: bool,
	/// Compute the key without inserting
	pub get_chk_only: bool,
	pub compress: bool,
	pub codec: Option<String>,
	pub metadata: BTreeMap<String, String>,
}

impl PutRequest {
	pub fn new(source: PutSource, key_type: KeyType) -> Self {
		PutRequest {
			source,
			key_type,
			revision: -1,
			name: None,
			private_key: None,
			public_key: None,
			priority: DEFAULT_PRIORITY,
			persistence: Persistence::Forever,
			global: true,
			get_chk_only: false,
			compress: true,
			codec: None,
			metadata: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutPhase {
	Idle,
	ComputingHash,
	GeneratingKey,
	WaitingForLock,
	Sending,
	Computing,
	Inserting,
	Done,
}

pub struct ClientPut {
	uid: Uuid,
	connection: Connection,
	queue: Arc<dyn QueueHandle>,
	registration: Registration,
	publisher: watch::Sender<TransferSnapshot>,
	query: TransferQuery,
	phase: PutPhase,

	source: PutSource,
	key_type: KeyType,
	revision: i64,
	name: String,
	private_key: Option<String>,
	public_key: Option<String>,
	get_chk_only: bool,
	compress: bool,
	codec: Option<String>,
	metadata: BTreeMap<String, String>,
	file_size: i64,
	file_hash: Option<String>,
	put_failed_code: i32,
	protocol_error_code: Option<i32>,

	pending_lock: Option<PendingLock>,
}

impl ClientPut {
	fn blank(connection: &Connection, queue: Arc<dyn QueueHandle>, source: PutSource, query: TransferQuery) -> Self {
		let (publisher, _) = watch::channel(TransferSnapshot::pending(TransferKind::Upload));
		let unbound: Weak<Mutex<ClientPut>> = Weak::new();
		let this: Weak<dyn Subscriber> = unbound;
		let name = source.target_name();
		ClientPut {
			uid: Uuid::new_v4(),
			connection: connection.clone(),
			queue,
			registration: Registration::new(connection.router().clone(), this),
			publisher,
			query,
			phase: PutPhase::Idle,
			source,
			key_type: KeyType::Chk,
			revision: -1,
			name,
			private_key: None,
			public_key: None,
			get_chk_only: false,
			compress: true,
			codec: None,
			metadata: BTreeMap::new(),
			file_size: -1,
			file_hash: None,
			put_failed_code: -1,
			protocol_error_code: None,
			pending_lock: None,
		}
	}

	async fn into_upload(self) -> Upload {
		let uid = self.uid;
		let watch = self.publisher.subscribe();
		let router = self.connection.router().clone();
		let machine = Arc::new_cyclic(move |weak: &Weak<Mutex<ClientPut>>| {
			let mut put = self;
			let this: Weak<dyn Subscriber> = weak.clone();
			put.registration = Registration::new(router, this);
			Mutex::new(put)
		});
		{
			let mut put = machine.lock().await;
			if let Some(identifier) = put.query.identifier.clone() {
				put.registration.bind(&identifier);
			}
			put.notify();
		}
		Upload { uid, machine, watch }
	}

	pub fn uid(&self) -> Uuid {
		self.uid
	}

	pub fn phase(&self) -> PutPhase {
		self.phase
	}

	pub fn query(&self) -> &TransferQuery {
		&self.query
	}

	pub fn key_type(&self) -> KeyType {
		self.key_type
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn private_key(&self) -> Option<&str> {
		self.private_key.as_deref()
	}

	pub fn public_key(&self) -> Option<&str> {
		self.public_key.as_deref()
	}

	pub fn file_hash(&self) -> Option<&str> {
		self.file_hash.as_deref()
	}

	pub fn put_failed_code(&self) -> i32 {
		self.put_failed_code
	}

	pub fn protocol_error_code(&self) -> Option<i32> {
		self.protocol_error_code
	}

	pub fn file_size(&self) -> i64 {
		self.file_size
	}

	/// The header and payload are being written right now
	pub fn is_sending(&self) -> bool {
		self.pending_lock.as_ref().map(|p| p.is_granted() && !p.is_finished()).unwrap_or(false)
	}

	/// URI of the `ClientPut` request
	pub fn insertion_key(&self) -> String {
		insertion_key(
			self.key_type,
			&self.name,
			self.revision,
			self.private_key.as_deref(),
			self.public_key.as_deref(),
		)
	}

	pub fn snapshot(&self) -> TransferSnapshot {
		TransferSnapshot {
			kind: TransferKind::Upload,
			identifier: self.query.identifier.clone(),
			key: self.public_key.clone(),
			filename: Some(self.source.target_name()).filter(|n| !n.is_empty()),
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

	/// Upload from disk: the node reads the file itself
	fn uses_disk(&self) -> bool {
		self.connection.is_local() && self.source.local_file().is_some()
	}

	fn fail_locally(&mut self, text: &str) {
		warn!("Upload of '{}': {}", self.name, text);
		self.query.fail(text);
		self.phase = PutPhase::Done;
		if let Some(pending) = self.pending_lock.take() {
			pending.cancel();
		}
	}

	// ====================================================================
	// Steps before the request
	// ====================================================================

	pub async fn start(&mut self) -> FcpResult<()> {
		self.put_failed_code = -1;
		self.protocol_error_code = None;
		self.query.identifier = None;
		self.registration.unbind();
		self.file_hash = None;
		self.query.attempt += 1;

		match self.source.size().await {
			Some(size) if size > 0 => self.file_size = size,
			_ => {
				self.fail_locally("EMPTY OR UNREACHABLE FILE");
				self.notify();
				return Ok(());
			}
		}

		self.query.status = TransferStatus::Running;
		self.query.fatal = true;
		self.query.set_block_numbers(-1, -1, -1, false);

		let target = self.source.target_name();
		let identifier = if target.is_empty() {
			self.queue.next_id()
		} else {
			format!("{}-{}", self.queue.next_id(), target)
		};
		self.query.identifier = Some(identifier.clone());
		self.registration.bind(&identifier);

		if let (true, Some(path)) = (self.uses_disk(), self.source.local_file()) {
			self.query.status_text = "Computing hash to get approval from the node ...".to_string();
			self.phase = PutPhase::ComputingHash;
			self.notify();

			let path = path.to_path_buf();
			let connection = self.connection.clone();
			let salt = file_hash_salt(connection.session_id(), &identifier);
			tokio::spawn(async move {
				let result = hash_file(&path, &salt, |percent| {
					connection.post(&identifier, LocalEvent::HashProgress(percent))
				})
				.await;
				connection.post(&identifier, LocalEvent::HashComputed(result.map_err(|e| e.to_string())));
			});
			return Ok(());
		}

		self.start_process().await
	}

	async fn start_process(&mut self) -> FcpResult<()> {
		if self.key_type.needs_keypair() && self.private_key.is_none() {
			let Some(identifier) = self.query.identifier.clone() else {
				return Ok(());
			};
			self.query.status_text = "Generating keys".to_string();
			self.phase = PutPhase::GeneratingKey;
			self.notify();

			let connection = self.connection.clone();
			let request_id = self.queue.next_id();
			tokio::spawn(async move {
				let keypair = generate_ssk(&connection, &request_id).await.map_err(|e| e.to_string());
				connection.post(&identifier, LocalEvent::SskGenerated(keypair));
			});
			return Ok(());
		}
		self.start_insert();
		Ok(())
	}

	fn put_message(&self, identifier: &str) -> Message {
		let mut message = Message::of(MessageKind::ClientPut).with("URI", self.insertion_key());
		for (key, value) in &self.metadata {
			message.set(&format!("Metadata.{}", key), value.as_str());
		}
		message.set("Identifier", identifier);
		message.set("MaxRetries", "-1");
		message.set("PriorityClass", self.query.priority.to_string());
		message.set("GetCHKOnly", if self.get_chk_only { "true" } else { "false" });
		message.set("Verbosity", "512");
		message.set("Global", self.query.global_field());
		if let Some(path) = self.source.local_file() {
			message.set("ClientToken", path.to_string_lossy().to_string());
		}
		message.set("Persistence", self.query.persistence.as_fcp());
		message.set("TargetFilename", self.source.target_name());

		match self.source.local_file() {
			Some(path) if self.uses_disk() => {
				message.set("UploadFrom", "disk");
				message.set("Filename", path.to_string_lossy().to_string());
				if let Some(hash) = &self.file_hash {
					message.set("FileHash", hash.as_str());
				}
			}
			_ => {
				message.set("UploadFrom", "direct");
				message.set_data_waiting(self.file_size);
			}
		}

		match (&self.codec, self.compress) {
			(_, false) => message.set("DontCompress", "true"),
			(Some(codec), true) => message.set("Codecs", codec.as_str()),
			(None, true) => {}
		}
		message
	}

	/// Queue for the writer lock; once granted, a background task writes the
	/// request (and the payload for direct uploads) then releases the lock
	fn start_insert(&mut self) {
		let Some(identifier) = self.query.identifier.clone() else {
			return;
		};
		self.query.node_progress = 0;
		self.query.status_text = "Waiting for socket availability".to_string();
		self.phase = PutPhase::WaitingForLock;
		self.notify();

		let message = self.put_message(&identifier);
		let payload = if self.uses_disk() { None } else { Some(self.source.clone()) };
		let connection = self.connection.clone();
		let lock = connection.writer_lock().clone();
		let key = identifier.clone();
		self.pending_lock = Some(PendingLock::spawn(lock, identifier, move |granted| async move {
			let permit = match granted {
				Ok(permit) => permit,
				Err(e) => {
					connection.post(&key, LocalEvent::WriterLockFailed(e.to_string()));
					return;
				}
			};
			connection.post(&key, LocalEvent::SendingStarted);
			let result = send_put(&connection, &key, &message, payload).await;
			drop(permit);
			connection.post(&key, LocalEvent::PayloadSent(result.map_err(|e| e.to_string())));
		}));
	}

	// ====================================================================
	// Owner actions
	// ====================================================================

	/// Withdraw the request. Refused while the payload is being sent.
	pub async fn remove_request(&mut self) -> FcpResult<bool> {
		if self.is_sending() {
			warn!("Can't stop '{}' while sending it to the node", self.name);
			if !self.query.status_text.ends_with("(can't interrupt while sending to the node)") {
				self.query.status_text.push_str(" (can't interrupt while sending to the node)");
			}
			self.notify();
			return Ok(false);
		}
		if let Some(pending) = self.pending_lock.take() {
			pending.cancel();
		}

		if self.query.status.is_running() || self.query.status.is_finished() {
			if let Some(identifier) = self.query.identifier.clone() {
				queries::remove_persistent_request(&self.connection, &identifier, self.query.global).await?;
			}
			self.query.status = TransferStatus::NotRunning;
			self.registration.unbind();
		}
		Ok(true)
	}

	pub async fn pause(&mut self) -> FcpResult<()> {
		self.remove_request().await?;
		self.query.status = TransferStatus::NotRunning;
		self.query.status_text = "Delayed".to_string();
		self.query.fatal = true;
		self.phase = PutPhase::Idle;
		self.notify();
		Ok(())
	}

	pub async fn stop(&mut self) -> FcpResult<bool> {
		let successful = self.query.status.is_finished() && self.query.status.is_successful();
		if !self.remove_request().await? {
			return Ok(false);
		}
		self.registration.unbind();
		self.query.status = if successful { TransferStatus::Successful } else { TransferStatus::Failed };
		self.query.status_text = "Stopped".to_string();
		self.query.fatal = true;
		self.phase = PutPhase::Done;
		self.notify();
		Ok(true)
	}

	pub async fn update_persistent_request(&mut self, client_token: bool) -> FcpResult<()> {
		let Some(identifier) = self.query.identifier.clone() else {
			return Ok(());
		};
		let token = if client_token {
			self.source.local_file().map(|p| p.to_string_lossy().to_string())
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

	// ====================================================================
	// Event handling
	// ====================================================================

	pub(crate) async fn handle(&mut self, event: Event) {
		match event {
			Event::Message { message, .. } => self.on_message(&message).await,
			Event::Local(local) => self.on_local(local).await,
			Event::Disconnected => {
				if self.query.status.is_running() {
					warn!("Connection lost while inserting '{}'", self.name);
					self.query.status = TransferStatus::Failed;
					self.query.fatal = false;
					self.query.status_text = "Disconnected (non-fatal)".to_string();
					self.phase = PutPhase::Done;
				}
				self.registration.unbind();
			}
		}
		self.notify();
	}

	async fn on_message(&mut self, message: &Message) {
		if message.identifier() != self.query.identifier.as_deref() {
			debug!("Ignoring '{}' for another request", message.name());
			return;
		}

		match message.kind() {
			MessageKind::URIGenerated | MessageKind::PutFetchable => {
				if let Some(uri) = message.get("URI") {
					self.public_key = Some(uri.replace("freenet:", ""));
					info!("{}: {}", message.name(), uri);
				}
				if self.get_chk_only {
					self.query.status_text = "CHK".to_string();
					self.query.status = TransferStatus::Successful;
					self.query.node_progress = 100;
					self.query.fatal = false;
					self.phase = PutPhase::Done;
					self.registration.unbind();
				} else if !self.query.status.is_finished() {
					self.query.status_text = "Inserting".to_string();
				}
			}
			MessageKind::PutSuccessful => self.on_put_successful(message),
			MessageKind::PersistentRequestModified => {
				match message.get("PriorityClass").and_then(|p| p.trim().parse().ok()) {
					Some(priority) => self.query.priority = priority,
					None => warn!("PersistentRequestModified without a priority class"),
				}
			}
			MessageKind::PersistentRequestRemoved => {
				info!("Insert of '{}' removed from the node", self.name);
				if !self.query.status.is_finished() {
					self.query.status = TransferStatus::Failed;
					self.query.fatal = true;
					self.query.status_text = "Removed".to_string();
				}
				self.phase = PutPhase::Done;
				self.registration.unbind();
				self.queue.remove(self.uid);
			}
			MessageKind::PutFailed => {
				let code = message.code().unwrap_or(-1);
				let description = message.get("CodeDescription").unwrap_or("?").to_string();
				if code == CODE_COLLISION {
					warn!("Collision: '{}' already holds other data", self.insertion_key());
				} else {
					warn!("PutFailed on '{}': {} ({})", self.name, description, code);
				}
				self.put_failed_code = code;
				self.query.fail_from(format!("Failed ({})", description), message);
				self.phase = PutPhase::Done;
				if let Some(pending) = self.pending_lock.take() {
					pending.cancel();
				}
			}
			MessageKind::ProtocolError => {
				let code = message.code().unwrap_or(-1);
				let description = message.get("CodeDescription").unwrap_or("?").to_string();
				error!("Protocol error on '{}': {} ({})", self.name, description, code);
				self.protocol_error_code = Some(code);
				self.query.fail_from(format!("Protocol error ({})", description), message);
				self.phase = PutPhase::Done;
				if let Some(pending) = self.pending_lock.take() {
					pending.cancel();
				}
			}
			MessageKind::IdentifierCollision => {
				warn!("Identifier collision on '{}'", self.name);
				self.query.status_text = "Identifier collision".to_string();
				self.restart().await;
			}
			MessageKind::PersistentPut => {
				if self.query.status.is_running() {
					self.query.status_text = "Inserting".to_string();
				}
			}
			MessageKind::StartedCompression => {
				self.query.status_text = "Compressing".to_string();
			}
			MessageKind::FinishedCompression => {
				let original = message.get_i64("OrigSize").unwrap_or(0);
				let compressed = message.get_i64("CompressedSize").unwrap_or(0);
				if compressed > 0 {
					info!("'{}' compressed to {}% of its size", self.name, original * 100 / compressed);
				}
				self.query.status_text = "Inserting".to_string();
			}
			MessageKind::SimpleProgress => self.on_simple_progress(message),
			_ => debug!("Unhandled '{}' for upload '{}'", message.name(), self.name),
		}
	}

	fn on_put_successful(&mut self, message: &Message) {
		self.query.status = TransferStatus::Successful;
		self.query.node_progress = 100;
		self.query.startup_time = message.get_i64("StartupTime");
		self.query.completion_time = message.get_i64("CompletionTime");
		self.phase = PutPhase::Done;
		self.registration.unbind();

		let Some(uri) = message.get("URI") else {
			warn!("PutSuccessful without URI for '{}'", self.name);
			self.query.status_text = "[Warning]".to_string();
			return;
		};
		let mut public = uri.replace("freenet:", "");
		if self.key_type == KeyType::Ksk {
			public = if self.revision >= 0 {
				format!("KSK@{}-{}", self.name, self.revision)
			} else {
				format!("KSK@{}", self.name)
			};
		}
		info!("'{}' inserted as {}", self.name, public);
		self.public_key = Some(public);
		self.query.status_text = "Finished".to_string();
	}

	fn on_simple_progress(&mut self, message: &Message) {
		let counters = (message.get_i64("Total"), message.get_i64("Required"), message.get_i64("Succeeded"));
		let (Some(total), Some(required), Some(succeeded)) = counters else {
			self.query.set_block_numbers(-1, -1, -1, false);
			return;
		};
		let reliable = message.get_bool("FinalizedTotal").unwrap_or(true);
		self.query.set_block_numbers(required, total, succeeded, reliable);
		if self.query.status.is_finished() {
			return;
		}
		self.query.status = TransferStatus::Running;
		if self.get_chk_only {
			self.query.status_text = "Computing".to_string();
			self.phase = PutPhase::Computing;
		} else {
			self.query.status_text = "Inserting".to_string();
			self.phase = PutPhase::Inserting;
		}
	}

	async fn restart(&mut self) {
		if let Err(e) = self.start().await {
			error!("Unable to restart '{}': {}", self.name, e);
			self.fail_locally("Unable to reach the node");
		}
	}

	async fn on_local(&mut self, event: LocalEvent) {
		match event {
			LocalEvent::HashProgress(percent) => {
				self.query.status_text = "Computing hash".to_string();
				self.query.set_block_numbers(100, 100, percent as i64, true);
			}
			LocalEvent::HashComputed(Ok(hash)) => {
				debug!("Hash of '{}' computed", self.name);
				self.file_hash = Some(hash);
				if let Err(e) = self.start_process().await {
					error!("Unable to continue '{}': {}", self.name, e);
					self.fail_locally("Unable to reach the node");
				}
			}
			LocalEvent::HashComputed(Err(e)) => {
				error!("Unable to hash '{}': {}", self.name, e);
				self.fail_locally("EMPTY OR UNREACHABLE FILE");
			}
			LocalEvent::SskGenerated(Ok(keypair)) => {
				self.apply_keypair(keypair);
				self.notify();
				self.start_insert();
			}
			LocalEvent::SskGenerated(Err(e)) => {
				error!("Unable to generate a keypair for '{}': {}", self.name, e);
				self.fail_locally("Unable to generate the keys");
			}
			LocalEvent::WriterLockFailed(reason) => {
				self.pending_lock = None;
				self.fail_locally(&format!("Unable to get the socket ({})", reason));
			}
			LocalEvent::SendingStarted => {
				self.query.status_text = "Sending to the node".to_string();
				self.query.status = TransferStatus::Running;
				self.phase = PutPhase::Sending;
			}
			LocalEvent::SendProgress(percent) => {
				self.query.node_progress = percent;
			}
			LocalEvent::PayloadSent(result) => self.on_payload_sent(result),
			other => debug!("Upload ignores {:?}", other),
		}
	}

	fn apply_keypair(&mut self, keypair: SskKeypair) {
		let request = keypair.request_uri.trim_end_matches('/');
		if self.key_type == KeyType::Usk {
			self.private_key = Some(keypair.insert_uri.replacen("SSK@", "USK@", 1));
			self.public_key = Some(format!("{}/{}", request.replacen("SSK@", "USK@", 1), self.name));
		} else {
			self.private_key = Some(keypair.insert_uri);
			self.public_key = Some(format!("{}/{}", request, self.name));
		}
	}

	fn on_payload_sent(&mut self, result: Result<(), String>) {
		self.pending_lock = None;
		if self.query.status.is_finished() {
			return;
		}
		match result {
			Ok(()) => {
				self.query.set_block_numbers(-1, -1, -1, true);
				self.query.status = TransferStatus::Running;
				self.query.fatal = true;
				self.query.node_progress = 100;
				if self.get_chk_only {
					self.query.status_text = "Computing".to_string();
					self.phase = PutPhase::Computing;
				} else {
					self.query.status_text = "Inserting".to_string();
					self.phase = PutPhase::Inserting;
				}
			}
			Err(e) => {
				error!("Unable to send '{}' to the node: {}", self.name, e);
				self.fail_locally("Unable to send the file to the node");
			}
		}
	}

	// ====================================================================
	// Persistence
	// ====================================================================

	pub fn parameters(&self) -> Parameters {
		let mut params = Parameters::new();
		params.set_opt("localFile", self.source.local_file().map(|p| p.to_string_lossy().to_string()));
		params.set("keyType", self.key_type.code());
		params.set("Revision", self.revision);
		params.set("Name", &self.name);
		params.set_opt("privateKey", self.private_key.as_ref());
		params.set_opt("publicKey", self.public_key.as_ref());
		params.set("priority", self.query.priority);
		params.set("global", self.query.global);
		params.set("persistence", self.query.persistence.code());
		params.set("status", &self.query.status_text);
		params.set("attempt", self.query.attempt);
		params.set_opt("identifier", self.query.identifier.as_ref());
		params.set("running", self.query.status.is_running());
		params.set("successful", self.query.status.is_successful());
		params.set("finished", self.query.status.is_finished());
		params.set("compressFile", self.compress);
		params.set_opt("compressionCodec", self.codec.as_ref());
		params
	}
}

/// Key to insert under. KSK revisions are appended with a dash, SSK ones
/// with a dash after the name, USK ones as an edition.
pub fn insertion_key(
	key_type: KeyType,
	name: &str,
	revision: i64,
	private_key: Option<&str>,
	public_key: Option<&str>,
) -> String {
	let private = private_key.unwrap_or_default();
	match key_type {
		KeyType::Chk => public_key.unwrap_or("CHK@").to_string(),
		KeyType::Ksk if revision >= 0 => format!("KSK@{}-{}", name, revision),
		KeyType::Ksk => format!("KSK@{}", name),
		KeyType::Ssk if revision >= 0 => format!("{}{}-{}", private, name, revision),
		KeyType::Usk if revision >= 0 => format!("{}{}/{}", private, name, revision),
		KeyType::Ssk | KeyType::Usk => format!("{}{}", private, name),
	}
}

/// Write the request header and, for direct uploads, the payload.
/// The caller holds the writer lock.
async fn send_put(
	connection: &Connection,
	identifier: &str,
	message: &Message,
	payload: Option<PutSource>,
) -> FcpResult<()> {
	let mut writer = connection.raw_writer().await;
	info!("Sending {} bytes for '{}'", message.data_waiting(), identifier);
	write_message(&mut *writer, message).await?;

	let total = message.data_waiting().max(0) as u64;
	let mut sent: u64 = 0;
	let mut last_notice = Instant::now();
	let mut report = |sent: u64| {
		if last_notice.elapsed() >= SEND_PROGRESS_INTERVAL && total > 0 {
			last_notice = Instant::now();
			connection.post(identifier, LocalEvent::SendProgress(((sent * 100) / total) as i32));
		}
	};

	match payload {
		None => {}
		Some(PutSource::Bytes { data, .. }) => {
			for chunk in data.chunks(PACKET_SIZE) {
				writer.write_all(chunk).await?;
				sent += chunk.len() as u64;
				report(sent);
			}
		}
		Some(PutSource::File(path)) => {
			let mut file = tokio::fs::File::open(&path).await?;
			let mut buf = vec![0u8; PACKET_SIZE];
			while sent < total {
				let want = ((total - sent) as usize).min(PACKET_SIZE);
				let n = file.read(&mut buf[..want]).await?;
				if n == 0 {
					return Err(FcpError::Io(std::io::ErrorKind::UnexpectedEof.into()));
				}
				writer.write_all(&buf[..n]).await?;
				sent += n as u64;
				report(sent);
			}
		}
	}
	writer.flush().await?;
	debug!("{} payload bytes sent for '{}'", sent, identifier);
	Ok(())
}

#[async_trait]
impl Subscriber for Mutex<ClientPut> {
	async fn on_event(&self, event: Event) {
		self.lock().await.handle(event).await;
	}
}

/// Owner's handle on an upload
#[derive(Clone)]
pub struct Upload {
	uid: Uuid,
	machine: Arc<Mutex<ClientPut>>,
	watch: watch::Receiver<TransferSnapshot>,
}

impl Upload {
	/// A fresh insert; nothing is sent before [`Transfer::start`]
	pub async fn new(connection: &Connection, queue: Arc<dyn QueueHandle>, request: PutRequest) -> Upload {
		let query = TransferQuery::new(request.priority, request.persistence, request.global);
		let mut put = ClientPut::blank(connection, queue, request.source, query);
		put.key_type = request.key_type;
		put.revision = request.revision;
		if let Some(name) = request.name {
			put.name = name;
		}
		put.private_key = request.private_key.filter(|k| !k.is_empty());
		put.public_key = request.public_key.filter(|k| !k.is_empty());
		put.get_chk_only = request.get_chk_only;
		put.compress = request.compress;
		put.codec = request.codec;
		put.metadata = request.metadata;
		put.into_upload().await
	}

	/// An insert the node reported with `PersistentPut`
	pub async fn from_persistent_put(
		connection: &Connection,
		queue: Arc<dyn QueueHandle>,
		message: &Message,
	) -> FcpResult<Upload> {
		let identifier = message.identifier().ok_or_else(|| ParamError::Missing("Identifier".into()))?.to_string();
		let public_key = message.get("URI").map(|u| u.replace("freenet:", ""));
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
		let path = message.get("ClientToken").filter(|t| ours && !t.is_empty()).map(PathBuf::from);
		let name = match (message.get("TargetFilename"), &path) {
			(Some(target), _) if !target.is_empty() => target.to_string(),
			(_, Some(path)) => path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
			_ => public_key.as_deref().and_then(crate::keys::filename_from_key).unwrap_or_else(|| identifier.clone()),
		};
		let source = match path {
			Some(path) => PutSource::File(path),
			None => PutSource::Bytes { name: name.clone(), data: Arc::new(Vec::new()) },
		};

		let mut put = ClientPut::blank(connection, queue, source, TransferQuery::new(priority, persistence, global));
		put.key_type = public_key.as_deref().and_then(KeyType::of).unwrap_or(KeyType::Chk);
		put.name = name;
		put.public_key = public_key;
		put.get_chk_only = message.get_bool("GetCHKOnly").unwrap_or(false);
		put.file_size = message.get_i64("DataLength").unwrap_or(-1);
		put.query.identifier = Some(identifier);
		put.query.status = TransferStatus::Running;
		put.query.status_text = "Inserting".to_string();
		put.query.node_progress = 100;
		put.phase = PutPhase::Inserting;
		Ok(put.into_upload().await)
	}

	/// Rebuild from [`Transfer::parameters`]
	pub async fn from_parameters(
		connection: &Connection,
		queue: Arc<dyn QueueHandle>,
		params: &Parameters,
	) -> FcpResult<Upload> {
		let code: i32 = params.parse("keyType")?;
		let key_type = KeyType::from_code(code)
			.ok_or_else(|| ParamError::Invalid { field: "keyType".into(), value: code.to_string() })?;
		let revision: i64 = params.parse_or("Revision", -1)?;
		let priority: u8 = params.parse("priority")?;
		let persistence_code: i32 = params.parse("persistence")?;
		let persistence = Persistence::from_code(persistence_code).ok_or_else(|| ParamError::Invalid {
			field: "persistence".into(),
			value: persistence_code.to_string(),
		})?;
		let global = params.flag("global")?;
		let running = params.flag("running")?;
		let successful = params.flag("successful")?;
		let finished = params.flag("finished")?;

		let name = params.get("Name").filter(|n| !n.is_empty()).map(str::to_string);
		let source = match params.get("localFile").filter(|f| !f.is_empty()) {
			Some(path) => PutSource::File(PathBuf::from(path)),
			None => PutSource::Bytes {
				name: name.clone().ok_or_else(|| ParamError::Missing("Name".into()))?,
				data: Arc::new(Vec::new()),
			},
		};

		let mut put = ClientPut::blank(connection, queue, source, TransferQuery::new(priority, persistence, global));
		put.key_type = key_type;
		put.revision = revision;
		if let Some(name) = name {
			put.name = name;
		}
		put.private_key = params.get("privateKey").filter(|k| !k.is_empty()).map(str::to_string);
		put.public_key = params.get("publicKey").filter(|k| !k.is_empty()).map(str::to_string);
		put.compress = params.flag("compressFile")?;
		put.codec = params.get("compressionCodec").filter(|c| !c.is_empty() && *c != "-1").map(str::to_string);
		put.query.attempt = params.parse_or("attempt", 0)?;
		put.query.identifier = params.get("identifier").filter(|i| !i.is_empty()).map(str::to_string);
		put.query.status = TransferStatus::from_flags(running, finished, successful);
		put.query.status_text = params.get("status").unwrap_or("Waiting").to_string();

		if persistence == Persistence::UntilDisconnect && !put.query.status.is_finished() {
			put.query.status = TransferStatus::NotRunning;
			put.query.status_text = "Waiting".to_string();
			put.query.identifier = None;
		}
		put.phase = match put.query.status {
			TransferStatus::NotRunning => PutPhase::Idle,
			TransferStatus::Running => PutPhase::Inserting,
			_ => PutPhase::Done,
		};
		Ok(put.into_upload().await)
	}

	pub async fn lock(&self) -> MutexGuard<'_, ClientPut> {
		self.machine.lock().await
	}
}

#[async_trait]
impl Transfer for Upload {
	fn uid(&self) -> Uuid {
		self.uid
	}

	fn kind(&self) -> TransferKind {
		TransferKind::Upload
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

	async fn save_file_to(&self, _dir: &Path) -> FcpResult<bool> {
		Ok(false)
	}

	async fn parameters(&self) -> Parameters {
		self.machine.lock().await.parameters()
	}
}


// vim: ts=4
