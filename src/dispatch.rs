//! Message routing
//!
//! Every connection owns one dispatcher task fed by a single queue: node
//! messages pushed by the reader task, and local events posted by background
//! work (hash computed, writer lock granted, payload sent, ...). Events are
//! delivered one at a time, so each subscriber sees them in arrival order.
//!
//! Subscribers are held weakly and keyed by identifier; the owner of a
//! transfer decides how long it lives.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{Connection, Payload};
use crate::generate_ssk::SskKeypair;
use crate::message::{Message, MessageKind};
use crate::test_dda::DdaVerdict;
use crate::writer_lock::WriterPermit;

/// What a subscriber receives
pub enum Event {
	/// A node message; the payload goes only to the first subscriber of the key
	Message { message: Message, payload: Option<Payload> },
	/// Completion of background work started by the subscriber
	Local(LocalEvent),
	/// The connection is gone
	Disconnected,
}

/// Results of background work, routed back through the dispatcher
pub enum LocalEvent {
	/// Upload hash progress, in percent
	HashProgress(i32),
	/// Base64 SHA-256 of the salted file, or the I/O error text
	HashComputed(Result<String, String>),
	/// Writer lock granted for a resumed download, on the connection to use
	WriterLockGranted { permit: WriterPermit, connection: Connection },
	/// Writer lock could not be obtained
	WriterLockFailed(String),
	/// Upload header about to go out
	SendingStarted,
	/// Upload payload progress, in percent
	SendProgress(i32),
	/// Upload header and payload written (lock already released)
	PayloadSent(Result<(), String>),
	SskGenerated(Result<SskKeypair, String>),
	DdaTested(Result<DdaVerdict, String>),
}

impl std::fmt::Debug for LocalEvent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			LocalEvent::HashProgress(_) => "HashProgress",
			LocalEvent::HashComputed(_) => "HashComputed",
			LocalEvent::WriterLockGranted { .. } => "WriterLockGranted",
			LocalEvent::WriterLockFailed(_) => "WriterLockFailed",
			LocalEvent::SendingStarted => "SendingStarted",
			LocalEvent::SendProgress(_) => "SendProgress",
			LocalEvent::PayloadSent(_) => "PayloadSent",
			LocalEvent::SskGenerated(_) => "SskGenerated",
			LocalEvent::DdaTested(_) => "DdaTested",
		};
		f.write_str(name)
	}
}

/// Receiver side of routed events
#[async_trait]
pub trait Subscriber: Send + Sync {
	async fn on_event(&self, event: Event);
}

/// Items of a connection's dispatch queue
pub(crate) enum Routed {
	Node { message: Message, payload: Option<Payload> },
	Local { key: String, event: LocalEvent },
	Closed,
}

/// Routing key of `TestDDA*` exchanges, which carry no identifier
pub fn dda_key(directory: &str) -> String {
	format!("dda:{}", directory)
}

/// Key a node message is routed by
pub fn routing_key(message: &Message) -> Option<String> {
	match message.kind() {
		MessageKind::TestDDAReply | MessageKind::TestDDAComplete => {
			message.get("Directory").map(dda_key)
		}
		_ => message.identifier().map(str::to_string),
	}
}

fn same(a: &Weak<dyn Subscriber>, b: &Weak<dyn Subscriber>) -> bool {
	std::ptr::addr_eq(a.as_ptr(), b.as_ptr())
}

#[derive(Default)]
struct Routes {
	by_key: HashMap<String, Vec<Weak<dyn Subscriber>>>,
	watchers: Vec<Weak<dyn Subscriber>>,
}

/// Identifier-keyed subscription table of one connection
#[derive(Clone, Default)]
pub struct Router {
	routes: Arc<Mutex<Routes>>,
}

impl Router {
	pub fn new() -> Self {
		Self::default()
	}

	/// Receive everything routed under `key`
	pub fn subscribe(&self, key: &str, subscriber: Weak<dyn Subscriber>) {
		if let Ok(mut routes) = self.routes.lock() {
			let entry = routes.by_key.entry(key.to_string()).or_default();
			if !entry.iter().any(|s| same(s, &subscriber)) {
				entry.push(subscriber);
			}
		}
	}

	pub fn unsubscribe(&self, key: &str, subscriber: &Weak<dyn Subscriber>) {
		if let Ok(mut routes) = self.routes.lock() {
			if let Some(entry) = routes.by_key.get_mut(key) {
				entry.retain(|s| !same(s, subscriber));
				if entry.is_empty() {
					routes.by_key.remove(key);
				}
			}
		}
	}

	/// Receive every node message, after the keyed subscribers
	pub fn watch(&self, subscriber: Weak<dyn Subscriber>) {
		if let Ok(mut routes) = self.routes.lock() {
			if !routes.watchers.iter().any(|s| same(s, &subscriber)) {
				routes.watchers.push(subscriber);
			}
		}
	}

	pub fn unwatch(&self, subscriber: &Weak<dyn Subscriber>) {
		if let Ok(mut routes) = self.routes.lock() {
			routes.watchers.retain(|s| !same(s, subscriber));
		}
	}

	/// Is anyone alive listening on `key`?
	pub fn is_subscribed(&self, key: &str) -> bool {
		!self.keyed(key).is_empty()
	}

	/// Subscribe a channel to `key`, for request/reply style exchanges
	pub fn channel(&self, key: &str) -> ChannelSubscription {
		let (tx, rx) = mpsc::unbounded_channel();
		let subscriber: Arc<dyn Subscriber> = Arc::new(ChannelSubscriber { tx: Mutex::new(Some(tx)) });
		self.subscribe(key, Arc::downgrade(&subscriber));
		ChannelSubscription { router: self.clone(), key: key.to_string(), subscriber, rx }
	}

	fn keyed(&self, key: &str) -> Vec<Arc<dyn Subscriber>> {
		let Ok(mut routes) = self.routes.lock() else {
			return Vec::new();
		};
		let Some(entry) = routes.by_key.get_mut(key) else {
			return Vec::new();
		};
		entry.retain(|s| s.strong_count() > 0);
		let alive: Vec<_> = entry.iter().filter_map(Weak::upgrade).collect();
		if entry.is_empty() {
			routes.by_key.remove(key);
		}
		alive
	}

	fn watchers(&self) -> Vec<Arc<dyn Subscriber>> {
		let Ok(mut routes) = self.routes.lock() else {
			return Vec::new();
		};
		routes.watchers.retain(|s| s.strong_count() > 0);
		routes.watchers.iter().filter_map(Weak::upgrade).collect()
	}

	fn everyone(&self) -> Vec<Arc<dyn Subscriber>> {
		let Ok(routes) = self.routes.lock() else {
			return Vec::new();
		};
		let mut all: Vec<Arc<dyn Subscriber>> = Vec::new();
		for weak in routes.by_key.values().flatten().chain(routes.watchers.iter()) {
			if let Some(strong) = weak.upgrade() {
				if !all.iter().any(|s| std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(&strong))) {
					all.push(strong);
				}
			}
		}
		all
	}

	/// Deliver one queued item. Must only run on the dispatcher task.
	pub(crate) async fn deliver(&self, routed: Routed) {
		match routed {
			Routed::Node { message, mut payload } => {
				let targets = match routing_key(&message) {
					Some(key) => self.keyed(&key),
					None => Vec::new(),
				};
				let watchers = self.watchers();
				if targets.is_empty() && watchers.is_empty() {
					debug!("No subscriber for '{}' ({:?})", message.name(), message.identifier());
				}

				for target in targets {
					let event = Event::Message { message: message.clone(), payload: payload.take() };
					target.on_event(event).await;
				}
				for watcher in watchers {
					watcher.on_event(Event::Message { message: message.clone(), payload: None }).await;
				}
			}
			Routed::Local { key, event } => match self.keyed(&key).into_iter().next() {
				Some(target) => target.on_event(Event::Local(event)).await,
				None => debug!("Dropping {:?} for '{}': nobody listens", event, key),
			},
			Routed::Closed => {
				for subscriber in self.everyone() {
					subscriber.on_event(Event::Disconnected).await;
				}
			}
		}
	}
}

/// Route binding of one subscriber, updated as its identifier changes
pub struct Registration {
	router: Router,
	this: Weak<dyn Subscriber>,
	key: Option<String>,
}

impl Registration {
	pub fn new(router: Router, this: Weak<dyn Subscriber>) -> Self {
		Registration { router, this, key: None }
	}

	/// Listen on `key` (and stop listening on the previous one)
	pub fn bind(&mut self, key: &str) {
		if self.key.as_deref() == Some(key) {
			return;
		}
		self.unbind();
		self.router.subscribe(key, self.this.clone());
		self.key = Some(key.to_string());
	}

	pub fn unbind(&mut self) {
		if let Some(key) = self.key.take() {
			self.router.unsubscribe(&key, &self.this);
		}
	}

	pub fn key(&self) -> Option<&str> {
		self.key.as_deref()
	}

	pub fn is_bound(&self) -> bool {
		self.key.is_some()
	}

	/// The subscriber this registration routes to
	pub fn subscriber(&self) -> Weak<dyn Subscriber> {
		self.this.clone()
	}
}

impl Drop for Registration {
	fn drop(&mut self) {
		self.unbind();
	}
}

struct ChannelSubscriber {
	tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
	async fn on_event(&self, event: Event) {
		let Ok(mut tx) = self.tx.lock() else {
			return;
		};
		match event {
			Event::Message { message, .. } => {
				if let Some(sender) = tx.as_ref() {
					let _ = sender.send(message);
				}
			}
			Event::Disconnected => {
				tx.take();
			}
			Event::Local(_) => {}
		}
	}
}

/// Messages routed under one key, as a stream
pub struct ChannelSubscription {
	router: Router,
	key: String,
	subscriber: Arc<dyn Subscriber>,
	rx: mpsc::UnboundedReceiver<Message>,
}

impl ChannelSubscription {
	/// Next message; `None` once the connection is closed
	pub async fn recv(&mut self) -> Option<Message> {
		self.rx.recv().await
	}

	pub fn key(&self) -> &str {
		&self.key
	}
}

impl Drop for ChannelSubscription {
	fn drop(&mut self) {
		self.router.unsubscribe(&self.key, &Arc::downgrade(&self.subscriber));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::Mutex as AsyncMutex;

	struct Recorder {
		seen: AsyncMutex<Vec<String>>,
	}

	#[async_trait]
	impl Subscriber for Recorder {
		async fn on_event(&self, event: Event) {
			let label = match event {
				Event::Message { message, payload } => {
					format!("{}{}", message.name(), if payload.is_some() { "+data" } else { "" })
				}
				Event::Local(local) => format!("{:?}", local),
				Event::Disconnected => "closed".to_string(),
			};
			self.seen.lock().await.push(label);
		}
	}

	fn recorder() -> Arc<Recorder> {
		Arc::new(Recorder { seen: AsyncMutex::new(Vec::new()) })
	}

	fn weak(r: &Arc<Recorder>) -> Weak<dyn Subscriber> {
		let s: Arc<dyn Subscriber> = r.clone();
		Arc::downgrade(&s)
	}

	#[test]
	fn test_routing_key() {
		let get = Message::new("SimpleProgress").with("Identifier", "abc");
		assert_eq!(routing_key(&get).as_deref(), Some("abc"));

		let dda = Message::new("TestDDAReply").with("Directory", "/tmp/x").with("Identifier", "z");
		assert_eq!(routing_key(&dda).as_deref(), Some("dda:/tmp/x"));

		assert_eq!(routing_key(&Message::new("NodeHello")), None);
	}

	#[tokio::test]
	async fn test_delivery_by_identifier() {
		let router = Router::new();
		let a = recorder();
		let b = recorder();
		router.subscribe("a", weak(&a));
		router.subscribe("b", weak(&b));

		let msg = Message::new("SimpleProgress").with("Identifier", "a");
		router.deliver(Routed::Node { message: msg, payload: None }).await;
		router.deliver(Routed::Local { key: "b".into(), event: LocalEvent::SendingStarted }).await;

		assert_eq!(*a.seen.lock().await, vec!["SimpleProgress"]);
		assert_eq!(*b.seen.lock().await, vec!["SendingStarted"]);
	}

	#[tokio::test]
	async fn test_dead_subscribers_are_pruned() {
		let router = Router::new();
		let a = recorder();
		router.subscribe("a", weak(&a));
		assert!(router.is_subscribed("a"));
		drop(a);
		assert!(!router.is_subscribed("a"));
	}

	#[tokio::test]
	async fn test_registration_rebinds() {
		let router = Router::new();
		let a = recorder();
		let mut reg = Registration::new(router.clone(), weak(&a));
		reg.bind("one");
		reg.bind("two");
		assert!(!router.is_subscribed("one"));
		assert!(router.is_subscribed("two"));
		drop(reg);
		assert!(!router.is_subscribed("two"));
	}

	#[tokio::test]
	async fn test_watchers_and_close() {
		let router = Router::new();
		let keyed = recorder();
		let watcher = recorder();
		router.subscribe("x", weak(&keyed));
		router.watch(weak(&watcher));

		let msg = Message::new("PersistentGet").with("Identifier", "x");
		router.deliver(Routed::Node { message: msg, payload: None }).await;
		router.deliver(Routed::Closed).await;

		assert_eq!(*keyed.seen.lock().await, vec!["PersistentGet", "closed"]);
		assert_eq!(*watcher.seen.lock().await, vec!["PersistentGet", "closed"]);
	}

	#[tokio::test]
	async fn test_channel_subscription() {
		let router = Router::new();
		let mut sub = router.channel("gen");
		router
			.deliver(Routed::Node { message: Message::new("SSKKeypair").with("Identifier", "gen"), payload: None })
			.await;
		assert_eq!(sub.recv().await.unwrap().name(), "SSKKeypair");

		router.deliver(Routed::Closed).await;
		assert!(sub.recv().await.is_none());
		drop(sub);
		assert!(!router.is_subscribed("gen"));
	}
}

// vim: ts=4
