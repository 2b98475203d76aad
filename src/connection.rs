//! Node session management
//!
//! A [`Connection`] is one FCP session: the `ClientHello`/`NodeHello`
//! handshake, a reader task that decodes frames (and pumps raw payloads), a
//! dispatcher task that routes them, and the shared write half guarded by the
//! writer lock.

use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{LocalEvent, Routed, Router};
use crate::error::{FcpError, FcpResult};
use crate::message::{read_frame, Message, MessageKind};
use crate::writer_lock::WriterLock;

/// Protocol version announced in `ClientHello`
pub const EXPECTED_VERSION: &str = "2.0";

/// Raw payload read granularity
pub const PACKET_SIZE: usize = 65536;

/// Chunks buffered between the reader task and a payload consumer
const PAYLOAD_QUEUE: usize = 8;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
	/// Name announced in `ClientHello`; must be unique per node
	pub client_name: String,
	/// Node runs on this host: direct disk access may be negotiated
	pub local: bool,
	/// Fetch finished persistent downloads without being asked
	pub auto_download: bool,
}

impl SessionOptions {
	pub fn new(client_name: impl Into<String>) -> Self {
		SessionOptions { client_name: client_name.into(), local: false, auto_download: true }
	}
}

/// Opens sessions to a node; lets a connection duplicate itself
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(&self, options: SessionOptions) -> FcpResult<Connection>;
}

/// TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
	pub host: String,
	pub port: u16,
}

impl TcpConnector {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		TcpConnector { host: host.into(), port }
	}

	/// Loopback nodes share our filesystem
	pub fn is_local(&self) -> bool {
		matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1" | "[::1]")
	}

	/// Connect with the given client name, detecting locality from the host
	pub async fn open(&self, client_name: &str, auto_download: bool) -> FcpResult<Connection> {
		let options =
			SessionOptions { client_name: client_name.to_string(), local: self.is_local(), auto_download };
		self.connect(options).await
	}
}

#[async_trait]
impl Connector for TcpConnector {
	async fn connect(&self, options: SessionOptions) -> FcpResult<Connection> {
		info!("Connecting to {}:{} as '{}'", self.host, self.port, options.client_name);
		let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
		stream.set_nodelay(true)?;
		let (read, write) = stream.into_split();
		let connector: Arc<dyn Connector> = Arc::new(self.clone());
		Connection::open(read, write, options, Some(connector)).await
	}
}

/// Raw bytes following a `Data`-terminated message
///
/// Dropping a payload before the end is safe: the reader task discards the
/// rest so the following messages stay readable.
pub struct Payload {
	len: u64,
	received: u64,
	rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl Payload {
	pub(crate) fn new(len: u64, rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
		Payload { len, received: 0, rx }
	}

	/// Announced length
	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Bytes handed out so far
	pub fn received(&self) -> u64 {
		self.received
	}

	/// Next chunk; `None` once everything was read
	pub async fn next_chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
		let chunk = self.rx.recv().await?;
		if let Ok(data) = &chunk {
			self.received += data.len() as u64;
		}
		Some(chunk)
	}

	/// Consume what is left without keeping it
	pub async fn drain(mut self) -> u64 {
		let mut skipped = 0;
		while let Some(chunk) = self.next_chunk().await {
			match chunk {
				Ok(data) => skipped += data.len() as u64,
				Err(_) => break,
			}
		}
		skipped
	}
}

impl std::fmt::Debug for Payload {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Payload").field("len", &self.len).field("received", &self.received).finish()
	}
}

struct Inner {
	writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
	writer_lock: WriterLock,
	router: Router,
	events: mpsc::UnboundedSender<Routed>,
	session_id: String,
	options: SessionOptions,
	connector: Option<Arc<dyn Connector>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.writer_lock.close();
		if let Ok(tasks) = self.tasks.lock() {
			for task in tasks.iter() {
				task.abort();
			}
		}
	}
}

/// One FCP session shared by every transfer that uses it
#[derive(Clone)]
pub struct Connection {
	inner: Arc<Inner>,
}

impl Connection {
	/// Perform the handshake over an already open stream, then start the
	/// reader and dispatcher tasks
	pub async fn open<R, W>(
		reader: R,
		writer: W,
		options: SessionOptions,
		connector: Option<Arc<dyn Connector>>,
	) -> FcpResult<Connection>
	where
		R: AsyncRead + Send + Unpin + 'static,
		W: AsyncWrite + Send + Unpin + 'static,
	{
		let mut writer: BoxedWriter = Box::new(writer);
		let mut reader = BufReader::new(reader);

		let hello = Message::of(MessageKind::ClientHello)
			.with("Name", options.client_name.as_str())
			.with("ExpectedVersion", EXPECTED_VERSION);
		writer.write_all(hello.encode().as_bytes()).await?;
		writer.flush().await?;

		let reply = read_frame(&mut reader).await?.ok_or(FcpError::Disconnected)?;
		let session_id = match reply.message.kind() {
			MessageKind::NodeHello => {
				reply.message.get("ConnectionIdentifier").unwrap_or_default().to_string()
			}
			MessageKind::CloseConnectionDuplicateClientName => {
				return Err(FcpError::Handshake {
					message: format!("client name '{}' already in use", options.client_name),
				});
			}
			_ => {
				return Err(FcpError::Handshake {
					message: format!("expected NodeHello, got '{}'", reply.message.name()),
				});
			}
		};
		info!(
			"Connected to node {} (session {})",
			reply.message.get("Version").unwrap_or("?"),
			session_id
		);

		let (events, queue) = mpsc::unbounded_channel();
		let router = Router::new();
		let writer_lock = WriterLock::new();

		let reader_task = tokio::spawn(read_loop(reader, events.clone(), writer_lock.clone()));
		let dispatch_task = tokio::spawn(dispatch_loop(queue, router.clone()));

		Ok(Connection {
			inner: Arc::new(Inner {
				writer: Arc::new(tokio::sync::Mutex::new(writer)),
				writer_lock,
				router,
				events,
				session_id,
				options,
				connector,
				tasks: Mutex::new(vec![reader_task, dispatch_task]),
			}),
		})
	}

	/// Send one message (without payload)
	pub async fn send(&self, message: &Message) -> FcpResult<()> {
		let mut writer = self.inner.writer.lock().await;
		write_message(&mut *writer, message).await
	}

	/// Exclusive access to the write half, for a header followed by raw bytes.
	/// Callers hold the writer lock first.
	pub async fn raw_writer(&self) -> OwnedMutexGuard<BoxedWriter> {
		self.inner.writer.clone().lock_owned().await
	}

	/// Post a local event to whoever listens on `key`
	pub fn post(&self, key: &str, event: LocalEvent) {
		let routed = Routed::Local { key: key.to_string(), event };
		if self.inner.events.send(routed).is_err() {
			debug!("Dispatcher gone, local event for '{}' dropped", key);
		}
	}

	/// Open another session with a derived client name
	pub async fn duplicate(&self, suffix: &str) -> FcpResult<Connection> {
		let connector = self.inner.connector.clone().ok_or_else(|| FcpError::InvalidState {
			message: "connection cannot be duplicated".to_string(),
		})?;
		let mut options = self.inner.options.clone();
		options.client_name = format!("{}-{}", options.client_name, suffix);
		connector.connect(options).await
	}

	/// Close the write half and stop the background tasks
	pub async fn disconnect(&self) {
		info!("Disconnecting session {}", self.inner.session_id);
		self.inner.writer_lock.close();
		let mut writer = self.inner.writer.lock().await;
		if let Err(e) = writer.shutdown().await {
			debug!("Shutdown of the write half failed: {}", e);
		}
		drop(writer);
		if let Ok(tasks) = self.inner.tasks.lock() {
			// the dispatcher must drain the close notification first
			if let Some(reader) = tasks.first() {
				reader.abort();
			}
		}
		let _ = self.inner.events.send(Routed::Closed);
	}

	pub fn router(&self) -> &Router {
		&self.inner.router
	}

	pub fn writer_lock(&self) -> &WriterLock {
		&self.inner.writer_lock
	}

	/// Node shares our filesystem
	pub fn is_local(&self) -> bool {
		self.inner.options.local
	}

	pub fn auto_download(&self) -> bool {
		self.inner.options.auto_download
	}

	/// `ConnectionIdentifier` from `NodeHello`
	pub fn session_id(&self) -> &str {
		&self.inner.session_id
	}

	pub fn client_name(&self) -> &str {
		&self.inner.options.client_name
	}

	/// Both handles designate the same session
	pub fn same_session(&self, other: &Connection) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("client_name", &self.inner.options.client_name)
			.field("session_id", &self.inner.session_id)
			.field("local", &self.inner.options.local)
			.finish()
	}
}

/// Encode and write one message header
pub async fn write_message<W>(writer: &mut W, message: &Message) -> FcpResult<()>
where
	W: AsyncWrite + Unpin + ?Sized,
{
	debug!("-> {}", message.name());
	writer.write_all(message.encode().as_bytes()).await?;
	writer.flush().await?;
	Ok(())
}

async fn read_loop<R>(mut reader: BufReader<R>, events: mpsc::UnboundedSender<Routed>, lock: WriterLock)
where
	R: AsyncRead + Unpin,
{
	loop {
		match read_frame(&mut reader).await {
			Ok(Some(frame)) => {
				debug!("<- {}", frame.message.name());
				if !frame.payload_follows {
					let routed = Routed::Node { message: frame.message, payload: None };
					if events.send(routed).is_err() {
						break;
					}
					continue;
				}

				let len = frame.message.data_waiting().max(0) as u64;
				let (tx, rx) = mpsc::channel(PAYLOAD_QUEUE);
				let routed = Routed::Node { message: frame.message, payload: Some(Payload::new(len, rx)) };
				if events.send(routed).is_err() {
					break;
				}
				if let Err(e) = pump_payload(&mut reader, len, tx).await {
					warn!("Connection lost while reading a payload: {}", e);
					break;
				}
			}
			Ok(None) => {
				info!("Node closed the connection");
				break;
			}
			Err(e) => {
				warn!("Read error on the node socket: {}", e);
				break;
			}
		}
	}
	lock.close();
	let _ = events.send(Routed::Closed);
}

/// Move exactly `len` bytes from the socket to the consumer, or to nowhere
/// once the consumer is gone
async fn pump_payload<R>(reader: &mut R, len: u64, tx: mpsc::Sender<io::Result<Vec<u8>>>) -> io::Result<()>
where
	R: AsyncRead + Unpin,
{
	let mut remaining = len;
	let mut consumer = Some(tx);

	while remaining > 0 {
		let want = remaining.min(PACKET_SIZE as u64) as usize;
		let mut buf = vec![0u8; want];
		let n = match reader.read(&mut buf).await {
			Ok(0) => {
				if let Some(tx) = &consumer {
					let _ = tx.send(Err(io::ErrorKind::UnexpectedEof.into())).await;
				}
				return Err(io::ErrorKind::UnexpectedEof.into());
			}
			Ok(n) => n,
			Err(e) => {
				if let Some(tx) = &consumer {
					let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
				}
				return Err(e);
			}
		};
		buf.truncate(n);
		remaining -= n as u64;

		if let Some(tx) = &consumer {
			if tx.send(Ok(buf)).await.is_err() {
				debug!("Payload consumer gone, discarding {} bytes", remaining);
				consumer = None;
			}
		}
	}
	Ok(())
}

async fn dispatch_loop(mut queue: mpsc::UnboundedReceiver<Routed>, router: Router) {
	while let Some(routed) = queue.recv().await {
		let closing = matches!(routed, Routed::Closed);
		router.deliver(routed).await;
		if closing {
			break;
		}
	}
	debug!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{duplex, AsyncBufReadExt};

	#[tokio::test]
	async fn test_handshake() {
		let (client, node) = duplex(4096);
		let (cr, cw) = tokio::io::split(client);
		let (nr, mut nw) = tokio::io::split(node);

		let fake_node = tokio::spawn(async move {
			let mut nr = BufReader::new(nr);
			let hello = read_frame(&mut nr).await.unwrap().unwrap();
			assert_eq!(hello.message.kind(), MessageKind::ClientHello);
			assert_eq!(hello.message.get("ExpectedVersion"), Some("2.0"));
			nw.write_all(b"NodeHello\nConnectionIdentifier=abc123\nVersion=Fred,0.7\nEndMessage\n")
				.await
				.unwrap();
			(nr, nw)
		});

		let conn = Connection::open(cr, cw, SessionOptions::new("test"), None).await.unwrap();
		assert_eq!(conn.session_id(), "abc123");
		assert!(!conn.is_local());
		let _streams = fake_node.await.unwrap();
	}

	#[tokio::test]
	async fn test_duplicate_name_fails_handshake() {
		let (client, node) = duplex(4096);
		let (cr, cw) = tokio::io::split(client);
		let (nr, mut nw) = tokio::io::split(node);

		tokio::spawn(async move {
			let mut nr = BufReader::new(nr);
			let mut line = String::new();
			while nr.read_line(&mut line).await.unwrap() > 0 && !line.ends_with("EndMessage\n") {}
			nw.write_all(b"CloseConnectionDuplicateClientName\nEndMessage\n").await.unwrap();
		});

		let err = Connection::open(cr, cw, SessionOptions::new("dup"), None).await.unwrap_err();
		assert!(matches!(err, FcpError::Handshake { .. }));
	}

	#[tokio::test]
	async fn test_dropped_payload_is_discarded() {
		let wire = b"AllData\nIdentifier=a\nDataLength=5\nData\nhelloNodeHello\nEndMessage\n".to_vec();
		let mut reader = BufReader::new(&wire[..]);
		let frame = read_frame(&mut reader).await.unwrap().unwrap();
		assert!(frame.payload_follows);

		let (tx, rx) = mpsc::channel(1);
		drop(rx);
		pump_payload(&mut reader, 5, tx).await.unwrap();

		let next = read_frame(&mut reader).await.unwrap().unwrap();
		assert_eq!(next.message.kind(), MessageKind::NodeHello);
	}

	#[tokio::test]
	async fn test_truncated_payload_reports_eof() {
		let wire = b"abc".to_vec();
		let mut reader = BufReader::new(&wire[..]);
		let (tx, rx) = mpsc::channel(4);
		let mut payload = Payload::new(10, rx);
		let pump = pump_payload(&mut reader, 10, tx).await;
		assert!(pump.is_err());
		assert_eq!(payload.next_chunk().await.unwrap().unwrap(), b"abc");
		assert!(payload.next_chunk().await.unwrap().is_err());
	}

	#[test]
	fn test_loopback_is_local() {
		assert!(TcpConnector::new("127.0.0.1", 9481).is_local());
		assert!(TcpConnector::new("localhost", 9481).is_local());
		assert!(!TcpConnector::new("192.168.1.10", 9481).is_local());
	}
}

// vim: ts=4
