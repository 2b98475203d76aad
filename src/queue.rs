//! Transfer queue
//!
//! Owns every transfer of a client, allocates identifiers and drops
//! transfers the node has forgotten.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::FcpResult;
use crate::store::QueueStore;
use crate::transfer::{Transfer, TransferKind};

/// What a transfer needs from the queue owning it
pub trait QueueHandle: Send + Sync {
	/// Identifier unique within the client: `<clientName>-<counter>`
	fn next_id(&self) -> String;

	/// The identifier was allocated by this client
	fn is_ours(&self, identifier: &str) -> bool;

	/// Forget a transfer; called once the node removed its request
	fn remove(&self, uid: Uuid);
}

pub struct TransferQueue {
	client_name: String,
	counter: AtomicU64,
	transfers: Mutex<Vec<Arc<dyn Transfer>>>,
	loaded: AtomicBool,
	loaded_notify: Notify,
}

impl TransferQueue {
	pub fn new(client_name: impl Into<String>) -> Arc<Self> {
		Arc::new(TransferQueue {
			client_name: client_name.into(),
			counter: AtomicU64::new(0),
			transfers: Mutex::new(Vec::new()),
			loaded: AtomicBool::new(false),
			loaded_notify: Notify::new(),
		})
	}

	pub fn client_name(&self) -> &str {
		&self.client_name
	}

	/// Queue a transfer. Refused when another one already uses its identifier.
	pub fn add(&self, transfer: Arc<dyn Transfer>) -> bool {
		let Ok(mut transfers) = self.transfers.lock() else {
			return false;
		};
		if let Some(id) = transfer.snapshot().identifier {
			if transfers.iter().any(|t| t.snapshot().identifier.as_deref() == Some(id.as_str())) {
				debug!("Transfer '{}' already queued", id);
				return false;
			}
			self.observe_identifier(&id);
		}
		transfers.push(transfer);
		true
	}

	pub fn find(&self, identifier: &str) -> Option<Arc<dyn Transfer>> {
		let transfers = self.transfers.lock().ok()?;
		transfers.iter().find(|t| t.snapshot().identifier.as_deref() == Some(identifier)).cloned()
	}

	pub fn get(&self, uid: Uuid) -> Option<Arc<dyn Transfer>> {
		let transfers = self.transfers.lock().ok()?;
		transfers.iter().find(|t| t.uid() == uid).cloned()
	}

	pub fn transfers(&self) -> Vec<Arc<dyn Transfer>> {
		self.transfers.lock().map(|t| t.clone()).unwrap_or_default()
	}

	pub fn downloads(&self) -> Vec<Arc<dyn Transfer>> {
		self.transfers().into_iter().filter(|t| t.kind() == TransferKind::Download).collect()
	}

	pub fn uploads(&self) -> Vec<Arc<dyn Transfer>> {
		self.transfers().into_iter().filter(|t| t.kind() == TransferKind::Upload).collect()
	}

	pub fn len(&self) -> usize {
		self.transfers.lock().map(|t| t.len()).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Keep the counter ahead of identifiers we allocated in a previous run
	pub fn observe_identifier(&self, identifier: &str) {
		let Some(rest) = identifier.strip_prefix(&format!("{}-", self.client_name)) else {
			return;
		};
		let number = rest.split('-').next().and_then(|n| n.parse::<u64>().ok());
		if let Some(number) = number {
			self.counter.fetch_max(number, Ordering::SeqCst);
		}
	}

	/// The node finished replaying its persistent requests
	pub fn set_loaded(&self) {
		self.loaded.store(true, Ordering::SeqCst);
		self.loaded_notify.notify_waiters();
	}

	pub fn is_loaded(&self) -> bool {
		self.loaded.load(Ordering::SeqCst)
	}

	/// Resolves once [`TransferQueue::set_loaded`] has been called
	pub async fn wait_loaded(&self) {
		loop {
			let notified = self.loaded_notify.notified();
			if self.is_loaded() {
				return;
			}
			notified.await;
		}
	}

	/// Persist the parameters of every transfer, replacing the previous content
	pub async fn save(&self, store: &QueueStore) -> FcpResult<()> {
		let mut entries = Vec::new();
		for transfer in self.transfers() {
			entries.push((transfer.kind(), transfer.parameters().await));
		}
		store.replace_all(&entries)?;
		info!("Saved {} transfers", entries.len());
		Ok(())
	}
}

impl QueueHandle for TransferQueue {
	fn next_id(&self) -> String {
		let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
		format!("{}-{}", self.client_name, n)
	}

	fn is_ours(&self, identifier: &str) -> bool {
		identifier.starts_with(&format!("{}-", self.client_name))
	}

	fn remove(&self, uid: Uuid) {
		if let Ok(mut transfers) = self.transfers.lock() {
			let before = transfers.len();
			transfers.retain(|t| t.uid() != uid);
			if transfers.len() != before {
				debug!("Transfer {} removed from the queue", uid);
			}
		}
	}
}


// vim: ts=4
