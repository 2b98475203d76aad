//! Direct disk access negotiation
//!
//! Before the node reads or writes files on our behalf it checks that we
//! share the directory: it asks us to write a token file and/or read one back.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::dispatch::{dda_key, ChannelSubscription};
use crate::error::{FcpError, FcpResult};
use crate::message::{Message, MessageKind};

/// Give up on a node that never completes the exchange
pub const DDA_TIMEOUT: Duration = Duration::from_secs(60);

/// What the node accepted to do in the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DdaVerdict {
	pub read_allowed: bool,
	pub write_allowed: bool,
}

/// Run the `TestDDARequest` exchange for `dir`.
///
/// Must not run on the dispatcher task: the replies are delivered by it.
pub async fn test_dda(
	connection: &Connection,
	dir: &Path,
	want_read: bool,
	want_write: bool,
) -> FcpResult<DdaVerdict> {
	let directory = dir.to_string_lossy().to_string();
	let mut replies = connection.router().channel(&dda_key(&directory));

	let request = Message::of(MessageKind::TestDDARequest)
		.with("Directory", directory.as_str())
		.with("WantReadDirectory", if want_read { "true" } else { "false" })
		.with("WantWriteDirectory", if want_write { "true" } else { "false" });
	connection.send(&request).await?;

	let (verdict, written) = tokio::time::timeout(DDA_TIMEOUT, exchange(connection, &directory, &mut replies))
		.await
		.map_err(|_| FcpError::InvalidState { message: format!("DDA test of '{}' timed out", directory) })??;

	if let Some(file) = written {
		if let Err(e) = tokio::fs::remove_file(&file).await {
			debug!("Unable to remove DDA token '{}': {}", file, e);
		}
	}
	info!("DDA on '{}': read={} write={}", directory, verdict.read_allowed, verdict.write_allowed);
	Ok(verdict)
}

/// Answer the node's challenges until it reports its verdict; returns the
/// token file we wrote, if any
async fn exchange(
	connection: &Connection,
	directory: &str,
	replies: &mut ChannelSubscription,
) -> FcpResult<(DdaVerdict, Option<String>)> {
	let mut written = None;
	while let Some(reply) = replies.recv().await {
		match reply.kind() {
			MessageKind::TestDDAReply => {
				if let (Some(file), Some(content)) = (reply.get("WriteFilename"), reply.get("ContentToWrite")) {
					match tokio::fs::write(file, content).await {
						Ok(()) => written = Some(file.to_string()),
						Err(e) => warn!("Unable to write DDA token '{}': {}", file, e),
					}
				}

				let mut response = Message::of(MessageKind::TestDDAResponse).with("Directory", directory);
				if let Some(file) = reply.get("ReadFilename") {
					match tokio::fs::read_to_string(file).await {
						Ok(content) => response.set("ReadContent", content),
						Err(e) => debug!("Unable to read DDA token '{}': {}", file, e),
					}
				}
				connection.send(&response).await?;
			}
			MessageKind::TestDDAComplete => {
				let verdict = DdaVerdict {
					read_allowed: reply.get_bool("ReadDirectoryAllowed").unwrap_or(false),
					write_allowed: reply.get_bool("WriteDirectoryAllowed").unwrap_or(false),
				};
				return Ok((verdict, written));
			}
			_ => debug!("Ignoring '{}' during DDA test", reply.name()),
		}
	}
	Err(FcpError::Disconnected)
}

// vim: ts=4
