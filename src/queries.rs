//! One-shot requests that need no state machine

use tracing::debug;

use crate::connection::Connection;
use crate::error::FcpResult;
use crate::message::{Message, MessageKind};

fn flag(value: bool) -> &'static str {
	if value {
		"true"
	} else {
		"false"
	}
}

/// Follow (or stop following) the node's global queue
pub async fn watch_global(connection: &Connection, enabled: bool) -> FcpResult<()> {
	let message = Message::of(MessageKind::WatchGlobal)
		.with("Enabled", flag(enabled))
		.with("VerbosityMask", "1");
	connection.send(&message).await
}

/// Ask the node to replay every persistent request it keeps for us
pub async fn list_persistent_requests(connection: &Connection) -> FcpResult<()> {
	connection.send(&Message::of(MessageKind::ListPersistentRequests)).await
}

pub fn modify_persistent_request_message(
	identifier: &str,
	global: bool,
	priority: u8,
	client_token: Option<&str>,
) -> Message {
	let mut message = Message::of(MessageKind::ModifyPersistentRequest)
		.with("Global", flag(global))
		.with("Identifier", identifier)
		.with("PriorityClass", priority.to_string());
	if let Some(token) = client_token {
		message.set("ClientToken", token);
	}
	message
}

/// Push a new priority (and optionally a client token) for a persistent request
pub async fn modify_persistent_request(
	connection: &Connection,
	identifier: &str,
	global: bool,
	priority: u8,
	client_token: Option<&str>,
) -> FcpResult<()> {
	debug!("Priority of '{}' -> {}", identifier, priority);
	connection.send(&modify_persistent_request_message(identifier, global, priority, client_token)).await
}

pub async fn remove_persistent_request(connection: &Connection, identifier: &str, global: bool) -> FcpResult<()> {
	let message = Message::of(MessageKind::RemovePersistentRequest)
		.with("Global", flag(global))
		.with("Identifier", identifier);
	connection.send(&message).await
}

/// Have the node resend the data of a finished request as `AllData`
pub async fn get_request_status(
	connection: &Connection,
	identifier: &str,
	global: bool,
	only_data: bool,
) -> FcpResult<()> {
	let message = Message::of(MessageKind::GetRequestStatus)
		.with("Identifier", identifier)
		.with("Global", flag(global))
		.with("OnlyData", flag(only_data));
	connection.send(&message).await
}


// vim: ts=4
