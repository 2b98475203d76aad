//! FCP message codec
//!
//! A message is a verb line, any number of `Field=Value` lines and a
//! terminator: `EndMessage`, or `DataLength=<n>` followed by `Data` when `n`
//! raw bytes follow on the stream. Raw bytes are never stored in a
//! [`Message`]; the connection hands them over separately (see
//! [`crate::connection::Payload`]).
//!
//! Decoding is fail-soft: structurally invalid input yields an empty message
//! whose kind is [`MessageKind::Unknown`].

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Field carrying the raw payload length
pub const DATA_LENGTH: &str = "DataLength";

/// Terminator of a message without payload
pub const END_MESSAGE: &str = "EndMessage";

/// Terminator of a message followed by raw bytes
pub const DATA: &str = "Data";

macro_rules! message_kinds {
	($($kind:ident),* $(,)?) => {
		/// Closed vocabulary of message verbs, both directions
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum MessageKind {
			$($kind,)*
			/// Anything not recognised (including empty names)
			Unknown,
		}

		impl MessageKind {
			const KNOWN: &'static [MessageKind] = &[$(MessageKind::$kind,)*];

			/// Canonical protocol spelling
			pub fn as_str(&self) -> &'static str {
				match self {
					$(MessageKind::$kind => stringify!($kind),)*
					MessageKind::Unknown => "Unknown",
				}
			}
		}
	};
}

message_kinds! {
	// client -> node
	ClientHello,
	ListPeer,
	ListPeers,
	ListPeerNotes,
	AddPeer,
	ModifyPeer,
	ModifyPeerNote,
	RemovePeer,
	GetNode,
	GetConfig,
	ModifyConfig,
	TestDDARequest,
	TestDDAResponse,
	GenerateSSK,
	ClientPut,
	ClientPutDiskDir,
	ClientPutComplexDir,
	ClientGet,
	LoadPlugin,
	ReloadPlugin,
	RemovePlugin,
	GetPluginInfo,
	FCPPluginMessage,
	SubscribeUSK,
	UnsubscribeUSK,
	WatchGlobal,
	GetRequestStatus,
	ListPersistentRequests,
	RemoveRequest,
	RemovePersistentRequest,
	ModifyPersistentRequest,
	Disconnect,
	Shutdown,
	Void,
	// node -> client
	NodeHello,
	CloseConnectionDuplicateClientName,
	Peer,
	PeerNote,
	EndListPeers,
	EndListPeerNotes,
	PeerRemoved,
	NodeData,
	ConfigData,
	TestDDAReply,
	TestDDAComplete,
	SSKKeypair,
	PersistentGet,
	PersistentPut,
	PersistentPutDir,
	URIGenerated,
	PutSuccessful,
	PutFetchable,
	DataFound,
	AllData,
	StartedCompression,
	FinishedCompression,
	SimpleProgress,
	ExpectedHashes,
	CompatibilityMode,
	SendingToNetwork,
	EndListPersistentRequests,
	PersistentRequestRemoved,
	PersistentRequestModified,
	PutFailed,
	GetFailed,
	ProtocolError,
	IdentifierCollision,
	UnknownNodeIdentifier,
	UnknownPeerNoteType,
	SubscribedUSK,
	SubscribedUSKUpdate,
	PluginInfo,
	PluginRemoved,
	FCPPluginReply,
	ExpectedMIME,
	ExpectedDataLength,
}

impl MessageKind {
	/// Case-insensitive lookup, surrounding whitespace ignored
	pub fn from_name(name: &str) -> MessageKind {
		let name = name.trim();
		if name.is_empty() {
			return MessageKind::Unknown;
		}
		MessageKind::KNOWN
			.iter()
			.copied()
			.find(|kind| kind.as_str().eq_ignore_ascii_case(name))
			.unwrap_or(MessageKind::Unknown)
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One protocol message (verb + fields), without its raw payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
	name: String,
	fields: BTreeMap<String, String>,
	/// 0: nothing follows; > 0: bytes still on the stream; < 0: gone
	data_waiting: i64,
}

impl Message {
	/// Start building a message with the given verb
	pub fn new(name: impl Into<String>) -> Self {
		Message { name: name.into(), fields: BTreeMap::new(), data_waiting: 0 }
	}

	/// Build from a known kind
	pub fn of(kind: MessageKind) -> Self {
		Message::new(kind.as_str())
	}

	/// Parse raw text. Never fails: invalid input gives an `Unknown` message.
	pub fn decode(raw: &str) -> Self {
		let lines: Vec<&str> = raw.split('\n').collect();

		let verb_line = match find_verb_line(&lines) {
			Some(idx) => idx,
			None => return Message::default(),
		};

		let mut message = Message::new(lines[verb_line].trim());
		for line in &lines[verb_line + 1..] {
			let line = line.trim_end_matches('\r');
			if let Some((field, value)) = line.split_once('=') {
				let field = field.trim();
				if !field.is_empty() {
					message.set(field, value);
				}
			}
		}
		message
	}

	/// Serialize for the wire. When a payload is pending, the caller must
	/// stream exactly that many bytes right after this text.
	pub fn encode(&self) -> String {
		let mut out = String::with_capacity(64 + self.fields.len() * 24);
		out.push_str(&self.name);
		out.push('\n');

		for (field, value) in &self.fields {
			if field == DATA_LENGTH {
				continue;
			}
			out.push_str(field);
			out.push('=');
			out.push_str(value);
			out.push('\n');
		}

		if self.data_waiting > 0 {
			out.push_str(DATA_LENGTH);
			out.push('=');
			out.push_str(&self.data_waiting.to_string());
			out.push('\n');
			out.push_str(DATA);
		} else {
			if let Some(length) = self.fields.get(DATA_LENGTH) {
				out.push_str(DATA_LENGTH);
				out.push('=');
				out.push_str(length);
				out.push('\n');
			}
			out.push_str(END_MESSAGE);
		}
		out.push('\n');
		out
	}

	/// Protocol verb as received or set
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Classified verb
	pub fn kind(&self) -> MessageKind {
		MessageKind::from_name(&self.name)
	}

	/// Field value, if present
	pub fn get(&self, field: &str) -> Option<&str> {
		self.fields.get(field).map(|v| v.as_str())
	}

	/// Set a field. `DataLength` also updates the pending payload length.
	pub fn set(&mut self, field: &str, value: impl Into<String>) {
		let value = value.into();
		if field == DATA_LENGTH {
			match value.trim().parse::<i64>() {
				Ok(length) => self.data_waiting = length,
				Err(_) => debug!("Ignoring unparsable DataLength '{}'", value),
			}
		}
		self.fields.insert(field.to_string(), value);
	}

	/// Builder form of [`Message::set`]
	pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
		self.set(field, value);
		self
	}

	/// Remove a field
	pub fn remove(&mut self, field: &str) -> Option<String> {
		if field == DATA_LENGTH {
			self.data_waiting = 0;
		}
		self.fields.remove(field)
	}

	/// All fields
	pub fn fields(&self) -> &BTreeMap<String, String> {
		&self.fields
	}

	/// Pending raw payload length (see the struct docs for the sign)
	pub fn data_waiting(&self) -> i64 {
		self.data_waiting
	}

	/// Declare a raw payload that will follow this message
	pub fn set_data_waiting(&mut self, amount: i64) {
		self.data_waiting = amount;
		if amount > 0 {
			self.fields.insert(DATA_LENGTH.to_string(), amount.to_string());
		} else if amount == 0 {
			self.fields.remove(DATA_LENGTH);
		}
	}

	/// `Identifier` field
	pub fn identifier(&self) -> Option<&str> {
		self.get("Identifier")
	}

	/// Integer field; `None` when absent or unparsable
	pub fn get_i64(&self, field: &str) -> Option<i64> {
		self.get(field).and_then(|v| v.trim().parse().ok())
	}

	/// Boolean field, `true`/`false` case-insensitively
	pub fn get_bool(&self, field: &str) -> Option<bool> {
		self.get(field).map(|v| v.trim().eq_ignore_ascii_case("true"))
	}

	/// Failures are fatal unless the node says `Fatal=false`
	pub fn is_fatal(&self) -> bool {
		self.get("Fatal") != Some("false")
	}

	/// `Code` field of failure messages
	pub fn code(&self) -> Option<i32> {
		self.get("Code").and_then(|v| v.trim().parse().ok())
	}
}

impl fmt::Display for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.encode())
	}
}

/// Index of the verb line: first non-blank line, which must not be a field
fn find_verb_line(lines: &[&str]) -> Option<usize> {
	for (idx, line) in lines.iter().enumerate() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if line.contains('=') {
			return None;
		}
		return Some(idx);
	}
	None
}

/// A decoded message as read off the stream
#[derive(Debug)]
pub struct Frame {
	pub message: Message,
	/// The frame ended with `Data`: `message.data_waiting()` raw bytes follow
	pub payload_follows: bool,
}

/// Read one frame from the node. `Ok(None)` on clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
	R: AsyncBufRead + Unpin,
{
	let mut raw = String::new();
	let mut line = String::new();
	let mut seen_verb = false;

	loop {
		line.clear();
		let n = reader.read_line(&mut line).await?;
		if n == 0 {
			if raw.trim().is_empty() {
				return Ok(None);
			}
			warn!("Stream ended inside a message");
			return Ok(Some(Frame { message: Message::decode(&raw), payload_follows: false }));
		}

		let trimmed = line.trim();
		if !seen_verb {
			if trimmed.is_empty() {
				continue;
			}
			seen_verb = true;
		} else if trimmed == END_MESSAGE || trimmed == DATA {
			let message = Message::decode(&raw);
			let payload_follows = trimmed == DATA && message.data_waiting() > 0;
			if trimmed == DATA && !payload_follows {
				warn!("'{}' announced data without a usable DataLength", message.name());
			}
			if message.kind() == MessageKind::ProtocolError && message.code() != Some(25) {
				warn!("PROTOCOL ERROR:\n{}", message);
			}
			return Ok(Some(Frame { message, payload_follows }));
		}

		raw.push_str(line.trim_end_matches(['\r', '\n']));
		raw.push('\n');
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_kind_lookup_is_case_insensitive() {
		assert_eq!(MessageKind::from_name("expectedhashes"), MessageKind::ExpectedHashes);
		assert_eq!(MessageKind::from_name("EXPECTEDHASHES"), MessageKind::ExpectedHashes);
		assert_eq!(MessageKind::from_name("   expectedhashes "), MessageKind::ExpectedHashes);
		assert_eq!(MessageKind::from_name("CompatibilityMode"), MessageKind::CompatibilityMode);
	}

	#[test]
	fn test_kind_lookup_unknown() {
		assert_eq!(MessageKind::from_name(""), MessageKind::Unknown);
		assert_eq!(MessageKind::from_name(" "), MessageKind::Unknown);
		assert_eq!(MessageKind::from_name("foo"), MessageKind::Unknown);
	}

	#[test]
	fn test_decode_with_payload_length() {
		let msg = Message::decode("DataFound\nGlobal=true\nDataLength=37261\nEndMessage");
		assert_eq!(msg.kind(), MessageKind::DataFound);
		assert_eq!(msg.data_waiting(), 37261);
		assert_eq!(msg.fields().len(), 2);
	}

	#[test]
	fn test_decode_without_payload() {
		let msg = Message::decode("DataFound\nGlobal=true\nEndMessage");
		assert_eq!(msg.kind(), MessageKind::DataFound);
		assert_eq!(msg.data_waiting(), 0);
		assert_eq!(msg.fields().len(), 1);
		assert_eq!(msg.get_bool("Global"), Some(true));
	}

	#[test]
	fn test_decode_blank_inputs() {
		for raw in ["", " \n     \n \n", "   "] {
			let msg = Message::decode(raw);
			assert_eq!(msg.kind(), MessageKind::Unknown);
			assert_eq!(msg.data_waiting(), 0);
			assert!(msg.fields().is_empty());
		}
	}

	#[test]
	fn test_decode_drops_malformed_fields() {
		let msg = Message::decode("DataFound\n=true\nnonsense\nEndMessage");
		assert_eq!(msg.kind(), MessageKind::DataFound);
		assert!(msg.fields().is_empty());
	}

	#[test]
	fn test_decode_keeps_empty_values_and_extra_equals() {
		let msg = Message::decode("DataFound\nGlobal=\nURI=KSK@a=b\nEndMessage");
		assert_eq!(msg.fields().len(), 2);
		assert_eq!(msg.get("Global"), Some(""));
		assert_eq!(msg.get("URI"), Some("KSK@a=b"));
	}

	#[test]
	fn test_decode_field_before_verb_is_unknown() {
		let msg = Message::decode("Global=true\nDataFound\nEndMessage");
		assert_eq!(msg.kind(), MessageKind::Unknown);
		assert!(msg.fields().is_empty());
	}

	#[test]
	fn test_encode_end_message() {
		let msg = Message::of(MessageKind::WatchGlobal).with("Enabled", "true");
		assert_eq!(msg.encode(), "WatchGlobal\nEnabled=true\nEndMessage\n");
	}

	#[test]
	fn test_encode_with_payload() {
		let mut msg = Message::of(MessageKind::ClientPut).with("URI", "CHK@");
		msg.set_data_waiting(12);
		assert_eq!(msg.encode(), "ClientPut\nURI=CHK@\nDataLength=12\nData\n");
	}

	#[test]
	fn test_decode_encode_decode_is_stable() {
		let raw = "SimpleProgress\nIdentifier=abc\nTotal=100\nRequired=50\nDataLength=7\nData\n";
		let first = Message::decode(raw);
		let second = Message::decode(&first.encode());
		assert_eq!(first.name(), second.name());
		assert_eq!(first.fields(), second.fields());
		assert_eq!(first.data_waiting(), second.data_waiting());
	}

	#[test]
	fn test_fatal_defaults_to_true() {
		assert!(Message::new("GetFailed").is_fatal());
		assert!(!Message::new("GetFailed").with("Fatal", "false").is_fatal());
	}

	#[tokio::test]
	async fn test_read_frame_sequence() {
		let wire = b"\nNodeHello\nConnectionIdentifier=xyz\nEndMessage\nAllData\nIdentifier=a\nDataLength=3\nData\nabc";
		let mut reader = tokio::io::BufReader::new(&wire[..]);

		let hello = read_frame(&mut reader).await.unwrap().unwrap();
		assert_eq!(hello.message.kind(), MessageKind::NodeHello);
		assert!(!hello.payload_follows);

		let data = read_frame(&mut reader).await.unwrap().unwrap();
		assert_eq!(data.message.kind(), MessageKind::AllData);
		assert!(data.payload_follows);
		assert_eq!(data.message.data_waiting(), 3);
	}

	#[tokio::test]
	async fn test_read_frame_data_length_without_data_terminator() {
		let wire = b"DataFound\nIdentifier=a\nDataLength=3\nEndMessage\n";
		let mut reader = tokio::io::BufReader::new(&wire[..]);
		let frame = read_frame(&mut reader).await.unwrap().unwrap();
		assert!(!frame.payload_follows);
		assert_eq!(frame.message.data_waiting(), 3);
		assert!(read_frame(&mut reader).await.unwrap().is_none());
	}
}

// vim: ts=4
