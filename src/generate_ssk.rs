//! Signed-subspace keypair generation

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{FcpError, FcpResult};
use crate::message::{Message, MessageKind};

/// Both halves of a freshly generated SSK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SskKeypair {
	pub insert_uri: String,
	pub request_uri: String,
}

fn strip_scheme(uri: &str) -> String {
	uri.replacen("freenet:", "", 1)
}

/// Send `GenerateSSK` and wait for the matching `SSKKeypair`.
///
/// Must not run on the dispatcher task: the reply is delivered by it.
pub async fn generate_ssk(connection: &Connection, identifier: &str) -> FcpResult<SskKeypair> {
	let mut replies = connection.router().channel(identifier);
	connection.send(&Message::of(MessageKind::GenerateSSK).with("Identifier", identifier)).await?;

	while let Some(reply) = replies.recv().await {
		match reply.kind() {
			MessageKind::SSKKeypair => {
				let insert = reply.get("InsertURI").unwrap_or_default();
				let request = reply.get("RequestURI").unwrap_or_default();
				debug!("Keypair '{}' generated", identifier);
				return Ok(SskKeypair { insert_uri: strip_scheme(insert), request_uri: strip_scheme(request) });
			}
			MessageKind::ProtocolError => {
				return Err(FcpError::Protocol {
					code: reply.code().unwrap_or(-1),
					description: reply.get("CodeDescription").unwrap_or("unknown").to_string(),
					fatal: reply.is_fatal(),
				});
			}
			_ => warn!("Unexpected '{}' while waiting for a keypair", reply.name()),
		}
	}
	Err(FcpError::Disconnected)
}


// vim: ts=4
