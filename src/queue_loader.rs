//! Queue loader
//!
//! Rebuilds the transfer queue from the requests the node keeps for us:
//! after `ListPersistentRequests`, every `PersistentGet`/`PersistentPut`
//! not queued yet becomes a transfer. The node ends the replay with
//! `EndListPersistentRequests`.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::client_get::Download;
use crate::client_put::Upload;
use crate::connection::Connection;
use crate::dispatch::{Event, Subscriber};
use crate::error::FcpResult;
use crate::message::{Message, MessageKind};
use crate::queries;
use crate::queue::{QueueHandle, TransferQueue};
use crate::transfer::Transfer;

pub struct QueueLoader {
	connection: Connection,
	queue: Arc<TransferQueue>,
}

impl QueueLoader {
	/// Start watching the connection. The loader stops once dropped.
	pub fn attach(connection: &Connection, queue: Arc<TransferQueue>) -> Arc<QueueLoader> {
		let loader = Arc::new(QueueLoader { connection: connection.clone(), queue });
		let subscriber: Arc<dyn Subscriber> = loader.clone();
		let weak: Weak<dyn Subscriber> = Arc::downgrade(&subscriber);
		connection.router().watch(weak);
		loader
	}

	/// Ask the node to replay its persistent requests (global queue included)
	pub async fn request(&self) -> FcpResult<()> {
		queries::watch_global(&self.connection, true).await?;
		queries::list_persistent_requests(&self.connection).await
	}

	async fn on_message(&self, message: &Message) {
		let kind = message.kind();
		if !matches!(kind, MessageKind::PersistentGet | MessageKind::PersistentPut) {
			if kind == MessageKind::EndListPersistentRequests {
				info!("Node replayed its persistent requests ({} queued)", self.queue.len());
				self.queue.set_loaded();
			}
			return;
		}

		let Some(identifier) = message.identifier() else {
			warn!("{} without identifier", message.name());
			return;
		};
		if self.queue.find(identifier).is_some() {
			debug!("'{}' already queued", identifier);
			return;
		}

		let queue: Arc<dyn QueueHandle> = self.queue.clone();
		let transfer: FcpResult<Arc<dyn Transfer>> = if kind == MessageKind::PersistentGet {
			Download::from_persistent_get(&self.connection, queue, message)
				.await
				.map(|d| Arc::new(d) as Arc<dyn Transfer>)
		} else {
			Upload::from_persistent_put(&self.connection, queue, message)
				.await
				.map(|u| Arc::new(u) as Arc<dyn Transfer>)
		};

		match transfer {
			Ok(transfer) => {
				if self.queue.add(transfer) {
					debug!("'{}' added from the node", identifier);
				}
			}
			Err(e) => warn!("Unable to rebuild '{}': {}", identifier, e),
		}
	}
}

#[async_trait]
impl Subscriber for QueueLoader {
	async fn on_event(&self, event: Event) {
		match event {
			Event::Message { message, .. } => self.on_message(&message).await,
			Event::Disconnected => debug!("Queue loader detached: connection closed"),
			Event::Local(_) => {}
		}
	}
}

// vim: ts=4
