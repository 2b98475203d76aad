//! Salted file hash proving to the node that we can read the file it is
//! asked to upload from disk

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_SIZE: usize = 65536;

/// Salt of the `FileHash` field: `<session id>-<identifier>-`
pub fn file_hash_salt(session_id: &str, identifier: &str) -> String {
	format!("{}-{}-", session_id, identifier)
}

/// Base64 SHA-256 of `salt` followed by the file content.
///
/// `progress` is called with each new whole percentage.
pub async fn hash_file<F>(path: &Path, salt: &str, mut progress: F) -> io::Result<String>
where
	F: FnMut(i32),
{
	let mut file = tokio::fs::File::open(path).await?;
	let total = file.metadata().await?.len();

	let mut hasher = Sha256::new();
	hasher.update(salt.as_bytes());

	let mut buf = vec![0u8; READ_SIZE];
	let mut done: u64 = 0;
	let mut reported = -1;
	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		done += n as u64;

		let percent = if total > 0 { ((done * 100) / total).min(100) as i32 } else { 100 };
		if percent != reported {
			reported = percent;
			progress(percent);
		}
	}
	Ok(STANDARD.encode(hasher.finalize()))
}


// vim: ts=4
