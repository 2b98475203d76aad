/// Integration tests for the download state machine, against a scripted node
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, wait_for, FakeConnector, FakeNode};
use fcpr::client_get::{Download, GetPhase, GetRequest};
use fcpr::connection::{Connection, SessionOptions};
use fcpr::message::Message;
use fcpr::queue::{QueueHandle, TransferQueue};
use fcpr::status::TransferStatus;
use fcpr::transfer::{Persistence, Transfer};

fn request(key: &str, dir: &std::path::Path, persistence: Persistence, global: bool) -> GetRequest {
	let mut request = GetRequest::new(key);
	request.destination = Some(dir.to_path_buf());
	request.persistence = persistence;
	request.global = global;
	request
}

#[tokio::test]
async fn test_client_get_fields() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let mut req = request("KSK@gpl.txt", dir.path(), Persistence::Forever, false);
	req.priority = 2;
	let download = Download::new(&connection, queue.clone(), req).await;
	download.start().await.unwrap();

	let get = node.expect("ClientGet").await;
	assert_eq!(get.get("URI"), Some("KSK@gpl.txt"));
	assert_eq!(get.get("Identifier"), Some("test-1-gpl.txt"));
	assert_eq!(get.get("PriorityClass"), Some("2"));
	assert_eq!(get.get("Persistence"), Some("forever"));
	assert_eq!(get.get("Global"), Some("false"));
	assert_eq!(get.get("ReturnType"), Some("direct"));
	assert_eq!(get.get("MaxRetries"), Some("-1"));
	assert_eq!(get.get("ClientToken"), Some(dir.path().to_string_lossy().as_ref()));

	let snapshot = download.snapshot();
	assert_eq!(snapshot.status, TransferStatus::Running);
	assert_eq!(snapshot.attempt, 1);
	assert_eq!(snapshot.status_text, "Requesting");
}

#[tokio::test]
async fn test_simple_progress_reliability() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gpl.txt", dir.path(), Persistence::Forever, true)).await;
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	let progress = |finalized: &str| {
		Message::new("SimpleProgress")
			.with("Identifier", id.as_str())
			.with("Total", "100")
			.with("Required", "100")
			.with("Succeeded", "50")
			.with("FinalizedTotal", finalized)
	};

	node.send(progress("false")).await;
	let snapshot = wait_for(&download, |s| s.progress.succeeded == 50).await;
	assert_eq!((snapshot.progress.succeeded, snapshot.progress.required, snapshot.progress.total), (50, 100, 100));
	assert!(!snapshot.progress.reliable);
	assert_eq!(snapshot.network_progress(), Some(50));
	assert_eq!(snapshot.file_size, 100 * 32768);
	assert_eq!(download.lock().await.phase(), GetPhase::Fetching);

	node.send(progress("true")).await;
	let snapshot = wait_for(&download, |s| s.progress.reliable).await;
	assert_eq!(snapshot.status, TransferStatus::Running);
}

#[tokio::test]
async fn test_redirect_restarts_with_new_key() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gpl.txt", dir.path(), Persistence::Forever, true)).await;
	download.start().await.unwrap();
	let first = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	node.send(
		Message::new("GetFailed")
			.with("Identifier", first.as_str())
			.with("Code", "27")
			.with("CodeDescription", "New URI")
			.with("RedirectURI", "USK@other/site/1")
			.with("Fatal", "true"),
	)
	.await;

	let removed = node.expect("RemovePersistentRequest").await;
	assert_eq!(removed.get("Identifier"), Some(first.as_str()));

	let retry = node.expect("ClientGet").await;
	assert_eq!(retry.get("URI"), Some("USK@other/site/1"));
	assert_ne!(retry.get("Identifier"), Some(first.as_str()));

	let snapshot = wait_for(&download, |s| s.key.as_deref() == Some("USK@other/site/1")).await;
	assert_eq!(snapshot.status, TransferStatus::Running);
	assert_eq!(snapshot.attempt, 2);
	assert_eq!(download.lock().await.phase(), GetPhase::Requesting);

	// the removal confirmation of the first attempt must not touch the new one
	node.send(Message::new("PersistentRequestRemoved").with("Identifier", first.as_str())).await;
	node.send(
		Message::new("SimpleProgress")
			.with("Identifier", retry.get("Identifier").unwrap())
			.with("Total", "10")
			.with("Required", "10")
			.with("Succeeded", "1"),
	)
	.await;
	let snapshot = wait_for(&download, |s| s.progress.succeeded == 1).await;
	assert_eq!(snapshot.status, TransferStatus::Running);
}

#[tokio::test]
async fn test_get_failed_records_code() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gone", dir.path(), Persistence::Forever, false)).await;
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	node.send(
		Message::new("GetFailed")
			.with("Identifier", id.as_str())
			.with("Code", "13")
			.with("CodeDescription", "Data not found")
			.with("Fatal", "false"),
	)
	.await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert!(!snapshot.fatal);
	assert_eq!(snapshot.status_text, "Failed (Data not found) (non-fatal)");
	assert_eq!(download.lock().await.get_failed_code(), Some(13));
}

#[tokio::test]
async fn test_all_data_written_to_destination() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gpl.txt", dir.path(), Persistence::UntilDisconnect, true))
			.await;
	download.start().await.unwrap();
	let get = node.expect("ClientGet").await;
	assert_eq!(get.get("Global"), Some("false"));
	let id = get.get("Identifier").unwrap().to_string();

	node.send(Message::new("DataFound").with("Identifier", id.as_str()).with("DataLength", "11")).await;
	node.send_with_data(Message::new("AllData").with("Identifier", id.as_str()), b"hello world").await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Successful);
	assert_eq!(snapshot.node_progress, 100);
	assert_eq!(snapshot.file_size, 11);
	assert!(download.lock().await.is_writing_successful());
	assert_eq!(tokio::fs::read(dir.path().join("gpl.txt")).await.unwrap(), b"hello world");
}

#[tokio::test]
async fn test_found_without_destination() {
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let listed = Message::new("PersistentGet")
		.with("Identifier", "other-2")
		.with("URI", "freenet:KSK@gpl.txt")
		.with("PersistenceType", "forever")
		.with("Global", "true");
	let download = Download::from_persistent_get(&connection, queue, &listed).await.unwrap();
	assert!(download.lock().await.destination().is_none());

	node.send(Message::new("DataFound").with("Identifier", "other-2").with("DataLength", "42")).await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Successful);
	assert_eq!(snapshot.status_text, "Available but not downloaded");
	assert_eq!(snapshot.file_size, 42);
	let get = download.lock().await;
	assert!(get.is_writing_successful());
	assert_eq!(get.phase(), GetPhase::AvailableNotDownloaded);
}

#[tokio::test]
async fn test_unclaimed_payload_is_discarded() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gpl.txt", dir.path(), Persistence::Forever, false)).await;
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	// nobody listens on this identifier: the bytes must be skipped
	let junk = vec![b'x'; 200_000];
	node.send_with_data(Message::new("AllData").with("Identifier", "someone-else-1"), &junk).await;
	node.send(
		Message::new("SimpleProgress")
			.with("Identifier", id.as_str())
			.with("Total", "4")
			.with("Required", "4")
			.with("Succeeded", "3"),
	)
	.await;

	let snapshot = wait_for(&download, |s| s.progress.succeeded == 3).await;
	assert_eq!(snapshot.progress.required, 4);
}

#[tokio::test]
async fn test_persistent_global_download_fetched_over_second_session() {
	let dir = tempfile::tempdir().unwrap();
	let (connector, mut sessions) = FakeConnector::new();
	let (connection, mut node) = connector.open_session(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gpl.txt", dir.path(), Persistence::Forever, true)).await;
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	node.send(Message::new("DataFound").with("Identifier", id.as_str()).with("DataLength", "5")).await;

	let mut data_node = tokio::time::timeout(common::TIMEOUT, sessions.recv()).await.unwrap().unwrap();
	let status = data_node.expect("GetRequestStatus").await;
	assert_eq!(status.get("Identifier"), Some(id.as_str()));
	assert_eq!(status.get("OnlyData"), Some("true"));
	assert_eq!(status.get("Global"), Some("true"));

	data_node.send_with_data(Message::new("AllData").with("Identifier", id.as_str()), b"12345").await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Successful);
	assert_eq!(tokio::fs::read(dir.path().join("gpl.txt")).await.unwrap(), b"12345");
	assert!(!connection.writer_lock().is_locked());
}

#[tokio::test]
async fn test_dda_negotiation_then_disk_return() {
	let dir = tempfile::tempdir().unwrap();
	let mut options = SessionOptions::new("test");
	options.local = true;
	let (connection, mut node) = connect(options).await;
	let queue = TransferQueue::new("test");

	let download =
		Download::new(&connection, queue, request("KSK@gpl.txt", dir.path(), Persistence::Forever, false)).await;
	download.start().await.unwrap();
	let get = node.expect("ClientGet").await;
	assert_eq!(get.get("ReturnType"), Some("disk"));
	let id = get.get("Identifier").unwrap().to_string();

	node.send(
		Message::new("ProtocolError")
			.with("Identifier", id.as_str())
			.with("Code", "25")
			.with("CodeDescription", "DDA denied"),
	)
	.await;

	let directory = dir.path().to_string_lossy().to_string();
	let request = node.expect("TestDDARequest").await;
	assert_eq!(request.get("Directory"), Some(directory.as_str()));
	assert_eq!(request.get("WantWriteDirectory"), Some("true"));

	let token = dir.path().join("DDACheck-1.tmp");
	node.send(
		Message::new("TestDDAReply")
			.with("Directory", directory.as_str())
			.with("WriteFilename", token.to_string_lossy().to_string())
			.with("ContentToWrite", "secret"),
	)
	.await;
	node.expect("TestDDAResponse").await;
	assert_eq!(tokio::fs::read_to_string(&token).await.unwrap(), "secret");

	node.send(
		Message::new("TestDDAComplete")
			.with("Directory", directory.as_str())
			.with("WriteDirectoryAllowed", "true"),
	)
	.await;

	let retry = node.expect("ClientGet").await;
	assert_eq!(retry.get("ReturnType"), Some("disk"));
	assert_eq!(retry.get("Identifier"), Some(id.as_str()));
	assert!(!download.lock().await.is_dda_refused());
}

#[tokio::test]
async fn test_stop_sends_removal_and_ignores_late_messages() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download = Arc::new(
		Download::new(&connection, queue.clone(), request("KSK@gpl.txt", dir.path(), Persistence::Forever, true))
			.await,
	);
	queue.add(download.clone());
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	assert!(download.stop().await.unwrap());
	let removed = node.expect("RemovePersistentRequest").await;
	assert_eq!(removed.get("Identifier"), Some(id.as_str()));
	let snapshot = download.snapshot();
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert_eq!(snapshot.status_text, "Stopped");

	node.send(
		Message::new("SimpleProgress")
			.with("Identifier", id.as_str())
			.with("Total", "4")
			.with("Required", "4")
			.with("Succeeded", "4"),
	)
	.await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(download.snapshot().progress.succeeded, -1);
	assert!(queue.is_ours(&id));
}

/// A persistent local-queue download past `DataFound`: it holds the writer
/// lock and has asked the node for the data
async fn requesting_data(
	connection: &Connection,
	node: &mut FakeNode,
	queue: Arc<TransferQueue>,
	dir: &std::path::Path,
) -> (Download, String) {
	let download = Download::new(connection, queue, request("KSK@gpl.txt", dir, Persistence::Forever, false)).await;
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();

	node.send(Message::new("DataFound").with("Identifier", id.as_str()).with("DataLength", "5")).await;
	let status = node.expect("GetRequestStatus").await;
	assert_eq!(status.get("Identifier"), Some(id.as_str()));
	assert_eq!(status.get("Global"), Some("false"));
	assert!(connection.writer_lock().is_locked());
	(download, id)
}

#[tokio::test]
async fn test_unknown_identifier_while_requesting_data_releases_lock() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let (download, id) = requesting_data(&connection, &mut node, TransferQueue::new("test"), dir.path()).await;

	node.send(
		Message::new("ProtocolError")
			.with("Identifier", id.as_str())
			.with("Code", "15")
			.with("CodeDescription", "No such identifier"),
	)
	.await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert_eq!(snapshot.status_text, "Protocol Error (No such identifier)");
	assert_eq!(download.lock().await.protocol_error_code(), Some(15));
	assert!(!connection.writer_lock().is_locked());
}

#[tokio::test]
async fn test_get_failed_while_requesting_data_releases_lock() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let (download, id) = requesting_data(&connection, &mut node, TransferQueue::new("test"), dir.path()).await;

	node.send(
		Message::new("GetFailed")
			.with("Identifier", id.as_str())
			.with("Code", "28")
			.with("CodeDescription", "All data not found"),
	)
	.await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert_eq!(snapshot.status_text, "Failed (All data not found)");
	assert_eq!(download.lock().await.get_failed_code(), Some(28));
	assert!(!connection.writer_lock().is_locked());
	assert!(!dir.path().join("gpl.txt").exists());
}

#[tokio::test]
async fn test_protocol_error_fails_and_unsubscribes() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let (download, id) = requesting_data(&connection, &mut node, TransferQueue::new("test"), dir.path()).await;

	node.send(
		Message::new("ProtocolError")
			.with("Identifier", id.as_str())
			.with("Code", "6")
			.with("CodeDescription", "Invalid field")
			.with("Fatal", "false"),
	)
	.await;

	let snapshot = wait_for(&download, |s| s.status.is_finished()).await;
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert!(!snapshot.fatal);
	assert_eq!(snapshot.status_text, "Protocol Error (Invalid field) (non-fatal)");
	assert_eq!(download.lock().await.protocol_error_code(), Some(6));
	assert_eq!(download.lock().await.phase(), GetPhase::Done);
	assert!(!connection.writer_lock().is_locked());

	node.send(
		Message::new("SimpleProgress")
			.with("Identifier", id.as_str())
			.with("Total", "4")
			.with("Required", "4")
			.with("Succeeded", "2"),
	)
	.await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(download.snapshot().progress.succeeded, -1);
}

#[tokio::test]
async fn test_removed_request_leaves_the_queue() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, mut node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let download = Arc::new(
		Download::new(&connection, queue.clone(), request("KSK@gpl.txt", dir.path(), Persistence::Forever, true))
			.await,
	);
	assert!(queue.add(download.clone()));
	download.start().await.unwrap();
	let id = node.expect("ClientGet").await.get("Identifier").unwrap().to_string();
	assert!(queue.find(&id).is_some());

	node.send(Message::new("PersistentRequestRemoved").with("Identifier", id.as_str()).with("Global", "true")).await;

	let snapshot = wait_for(&*download, |s| s.status_text == "Removed").await;
	assert_eq!(snapshot.status, TransferStatus::Failed);
	assert!(queue.is_empty());
	assert!(queue.find(&id).is_none());
}

#[tokio::test]
async fn test_parameters_round_trip() {
	let dir = tempfile::tempdir().unwrap();
	let (connection, _node) = connect(SessionOptions::new("test")).await;
	let queue = TransferQueue::new("test");

	let mut req = request("CHK@abc,def,AAIC--8/report.pdf", dir.path(), Persistence::UntilNodeReboot, true);
	req.priority = 1;
	req.max_retries = 5;
	let download = Download::new(&connection, queue.clone(), req).await;
	let params = download.parameters().await;
	assert_eq!(params.get("Filename"), Some("report.pdf"));
	assert_eq!(params.get("Persistence"), Some("1"));

	let resumed = Download::from_parameters(&connection, queue.clone(), &params).await.unwrap();
	assert_eq!(resumed.parameters().await, params);

	// a connection-bound request cannot survive a restart
	let mut running = params.clone();
	running.set("Persistence", 2);
	running.set("Running", true);
	running.set("Identifier", "test-9-report.pdf");
	let resumed = Download::from_parameters(&connection, queue.clone(), &running).await.unwrap();
	let snapshot = resumed.snapshot();
	assert_eq!(snapshot.status, TransferStatus::NotRunning);
	assert_eq!(snapshot.status_text, "Waiting");
	assert_eq!(snapshot.identifier, None);

	let mut broken = params.clone();
	broken.set("Priority", "high");
	assert!(Download::from_parameters(&connection, queue, &broken).await.is_err());
}

// vim: ts=4
