/// A download whose file cannot be created: the announced bytes are skipped
/// and the session keeps working. Alone in its binary since it points
/// TMPDIR at a missing directory.
mod common;

use common::{connect, wait_for};
use fcpr::client_get::{Download, GetRequest};
use fcpr::connection::SessionOptions;
use fcpr::message::Message;
use fcpr::queue::TransferQueue;
use fcpr::status::TransferStatus;
use fcpr::transfer::{Persistence, Transfer};

fn request(key: &str, dir: &std::path::Path) -> GetRequest {
	let mut request = GetRequest::new(key);
	request.destination = Some(dir.to_path_buf());
	request.persistence = Persistence::UntilDisconnect;
	request
}

#[tokio::test]
async fn test_unwritable_destination_fails_and_drains_payload() {
	let broken = tempfile::tempdir().unwrap();
	let good = tempfile::tempdir().unwrap();
	// the target path is a directory, and the temporary-file fallback has nowhere to go
	std::fs::create_dir(broken.path().join("gpl.txt")).unwrap();
	let missing_tmp = broken.path().join("no-such-tmp");
	std::env::set_var("TMPDIR", &missing_tmp);

	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let failing = Download::new(&connection, queue.clone(), request("KSK@gpl.txt", broken.path())).await;
	failing.start().await.unwrap();
	let failing_id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	let next = Download::new(&connection, queue, request("KSK@next.txt", good.path())).await;
	next.start().await.unwrap();
	let next_id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	let junk = vec![b'x'; 300_000];
	node.send_with_data(Message::new("AllData").with("Identifier", failing_id.as_str()), &junk).await;
	node.send_with_data(Message::new("AllData").with("Identifier", next_id.as_str()), b"still in sync").await;

	let snapshot = wait_for(&failing, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert!(snapshot.fatal);
	assert_eq!(snapshot.status_text, "Error while receiving the file (Write error)");
	assert!(!failing.lock().await.is_writing_successful());
	assert!(broken.path().join("gpl.txt").is_dir());
	assert!(!missing_tmp.exists());

	let snapshot = wait_for(&next, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Successful);
	assert_eq!(tokio::fs::read(good.path().join("next.txt")).await.unwrap(), b"still in sync");
	assert!(!connection.writer_lock().is_locked());
}

// vim: ts=4
