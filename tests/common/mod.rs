//! Scripted node for integration tests
//!
//! The node side of an in-memory duplex stream: tests read what the client
//! sends and answer by hand.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use fcpr::connection::{Connection, Connector, SessionOptions};
use fcpr::error::FcpResult;
use fcpr::message::{read_frame, Message};
use fcpr::transfer::{Transfer, TransferSnapshot};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeNode {
	reader: BufReader<ReadHalf<DuplexStream>>,
	writer: WriteHalf<DuplexStream>,
}

impl FakeNode {
	/// Next frame from the client, with its payload; panics on timeout
	pub async fn recv(&mut self) -> (Message, Vec<u8>) {
		let frame = tokio::time::timeout(TIMEOUT, read_frame(&mut self.reader))
			.await
			.expect("client sent nothing")
			.expect("read error")
			.expect("client closed the stream");
		let mut data = Vec::new();
		if frame.payload_follows {
			data.resize(frame.message.data_waiting() as usize, 0);
			self.reader.read_exact(&mut data).await.expect("payload");
		}
		(frame.message, data)
	}

	/// Next frame, which must be a `name` message
	pub async fn expect(&mut self, name: &str) -> Message {
		let (message, _) = self.recv().await;
		assert_eq!(message.name(), name, "unexpected frame:\n{}", message);
		message
	}

	/// Next frame with its payload, which must be a `name` message
	pub async fn expect_with_data(&mut self, name: &str) -> (Message, Vec<u8>) {
		let (message, data) = self.recv().await;
		assert_eq!(message.name(), name, "unexpected frame:\n{}", message);
		(message, data)
	}

	pub async fn send(&mut self, message: Message) {
		self.writer.write_all(message.encode().as_bytes()).await.expect("write");
		self.writer.flush().await.expect("flush");
	}

	pub async fn send_with_data(&mut self, mut message: Message, data: &[u8]) {
		message.set_data_waiting(data.len() as i64);
		self.writer.write_all(message.encode().as_bytes()).await.expect("write");
		self.writer.write_all(data).await.expect("write");
		self.writer.flush().await.expect("flush");
	}

	/// Nothing arrives within `wait`
	pub async fn assert_silent(&mut self, wait: Duration) {
		if let Ok(Ok(Some(frame))) = tokio::time::timeout(wait, read_frame(&mut self.reader)).await {
			panic!("unexpected frame:\n{}", frame.message);
		}
	}
}

/// A node stream with `NodeHello` already queued, and the client halves
fn pair() -> (FakeNode, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
	let (client, node) = tokio::io::duplex(1 << 20);
	let (client_read, client_write) = tokio::io::split(client);
	let (node_read, node_write) = tokio::io::split(node);
	let node = FakeNode { reader: BufReader::new(node_read), writer: node_write };
	(node, client_read, client_write)
}

/// Open a session against a fresh fake node
pub async fn connect(options: SessionOptions) -> (Connection, FakeNode) {
	open(options, None).await
}

async fn open(options: SessionOptions, connector: Option<Arc<dyn Connector>>) -> (Connection, FakeNode) {
	let (mut node, client_read, client_write) = pair();
	node.send(
		Message::new("NodeHello")
			.with("ConnectionIdentifier", "session-1")
			.with("Version", "Fred,0.7,1.0,1500")
			.with("FCPVersion", "2.0"),
	)
	.await;
	let connection = Connection::open(client_read, client_write, options, connector).await.expect("handshake");
	node.expect("ClientHello").await;
	(connection, node)
}

/// Hands every additional session it opens to the test
pub struct FakeConnector {
	nodes: mpsc::UnboundedSender<FakeNode>,
}

impl FakeConnector {
	pub fn new() -> (Arc<FakeConnector>, mpsc::UnboundedReceiver<FakeNode>) {
		let (nodes, rx) = mpsc::unbounded_channel();
		(Arc::new(FakeConnector { nodes }), rx)
	}

	/// Open the first session through this connector
	pub async fn open_session(self: &Arc<Self>, options: SessionOptions) -> (Connection, FakeNode) {
		let connector: Arc<dyn Connector> = self.clone();
		open(options, Some(connector)).await
	}
}

#[async_trait]
impl Connector for FakeConnector {
	async fn connect(&self, options: SessionOptions) -> FcpResult<Connection> {
		let connector: Arc<dyn Connector> = Arc::new(FakeConnector { nodes: self.nodes.clone() });
		let (connection, node) = open(options, Some(connector)).await;
		let _ = self.nodes.send(node);
		Ok(connection)
	}
}

/// Wait until the published state satisfies `pred`
pub async fn wait_for<F>(transfer: &dyn Transfer, pred: F) -> TransferSnapshot
where
	F: Fn(&TransferSnapshot) -> bool,
{
	let mut watch = transfer.watch();
	let snapshot = tokio::time::timeout(TIMEOUT, watch.wait_for(|s| pred(s)))
		.await
		.expect("state not reached in time")
		.expect("transfer dropped");
	snapshot.clone()
}

// vim: ts=4
