//! Per-connection writer lock
//!
//! Serializes the raw byte phases of transfers sharing one socket: an upload
//! streaming its payload, a download receiving `AllData`. Waiters are served
//! in FIFO order. A permit releases the lock when dropped, on every exit path.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{FcpError, FcpResult};

/// Exclusive right to perform raw I/O on a connection
#[derive(Clone)]
pub struct WriterLock {
	semaphore: Arc<Semaphore>,
	holder: Arc<Mutex<Option<String>>>,
}

impl WriterLock {
	pub fn new() -> Self {
		WriterLock { semaphore: Arc::new(Semaphore::new(1)), holder: Arc::new(Mutex::new(None)) }
	}

	/// Wait for the lock. Fails only once the connection is gone.
	pub async fn acquire(&self, who: &str) -> FcpResult<WriterPermit> {
		debug!("{} waiting for the writer lock", who);
		let permit =
			self.semaphore.clone().acquire_owned().await.map_err(|_| FcpError::Disconnected)?;
		Ok(self.grant(permit, who))
	}

	/// Take the lock only if nobody holds it
	pub fn try_acquire(&self, who: &str) -> Option<WriterPermit> {
		let permit = self.semaphore.clone().try_acquire_owned().ok()?;
		Some(self.grant(permit, who))
	}

	fn grant(&self, permit: OwnedSemaphorePermit, who: &str) -> WriterPermit {
		debug!("{} takes the writer lock", who);
		if let Ok(mut holder) = self.holder.lock() {
			*holder = Some(who.to_string());
		}
		WriterPermit { _permit: permit, holder: self.holder.clone(), who: who.to_string() }
	}

	/// Current owner, if any
	pub fn holder(&self) -> Option<String> {
		self.holder.lock().ok().and_then(|h| h.clone())
	}

	pub fn is_locked(&self) -> bool {
		self.semaphore.available_permits() == 0
	}

	/// Wake every waiter with an error; used when the socket closes
	pub fn close(&self) {
		self.semaphore.close();
	}
}

impl Default for WriterLock {
	fn default() -> Self {
		Self::new()
	}
}

/// Held lock; dropping it lets the next waiter in
pub struct WriterPermit {
	_permit: OwnedSemaphorePermit,
	holder: Arc<Mutex<Option<String>>>,
	who: String,
}

impl WriterPermit {
	pub fn holder(&self) -> &str {
		&self.who
	}
}

impl Drop for WriterPermit {
	fn drop(&mut self) {
		debug!("{} releases the writer lock", self.who);
		if let Ok(mut holder) = self.holder.lock() {
			if holder.as_deref() == Some(self.who.as_str()) {
				*holder = None;
			}
		}
	}
}

impl std::fmt::Debug for WriterPermit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WriterPermit").field("who", &self.who).finish()
	}
}

/// Background wait for the writer lock
///
/// Once granted, `then` runs with the permit. The wait can be cancelled
/// until the permit is granted; after that the raw phase runs to completion.
pub struct PendingLock {
	handle: JoinHandle<()>,
	granted: Arc<AtomicBool>,
}

impl PendingLock {
	pub fn spawn<F, Fut>(lock: WriterLock, who: String, then: F) -> PendingLock
	where
		F: FnOnce(FcpResult<WriterPermit>) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		PendingLock::spawn_with(async move { Ok((lock, ())) }, who, move |granted| {
			then(granted.map(|(permit, ())| permit))
		})
	}

	/// Like [`PendingLock::spawn`], when the lock (and whatever comes with
	/// it, such as a freshly opened session) must be prepared first
	pub fn spawn_with<P, T, F, Fut>(prepare: P, who: String, then: F) -> PendingLock
	where
		P: Future<Output = FcpResult<(WriterLock, T)>> + Send + 'static,
		T: Send + 'static,
		F: FnOnce(FcpResult<(WriterPermit, T)>) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let granted = Arc::new(AtomicBool::new(false));
		let flag = granted.clone();
		let handle = tokio::spawn(async move {
			let result = match prepare.await {
				Ok((lock, extra)) => lock.acquire(&who).await.map(|permit| (permit, extra)),
				Err(e) => Err(e),
			};
			flag.store(result.is_ok(), Ordering::SeqCst);
			then(result).await;
		});
		PendingLock { handle, granted }
	}

	/// Give up the queue slot. Returns false when the permit was already
	/// granted (the raw phase is running or done).
	pub fn cancel(&self) -> bool {
		if self.granted.load(Ordering::SeqCst) {
			return false;
		}
		self.handle.abort();
		true
	}

	pub fn is_granted(&self) -> bool {
		self.granted.load(Ordering::SeqCst)
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;
	use tokio::sync::{mpsc, oneshot};

	#[tokio::test]
	async fn test_permit_released_on_drop() {
		let lock = WriterLock::new();
		let permit = lock.acquire("a").await.unwrap();
		assert!(lock.is_locked());
		assert_eq!(lock.holder().as_deref(), Some("a"));
		assert!(lock.try_acquire("b").is_none());

		drop(permit);
		assert!(!lock.is_locked());
		assert_eq!(lock.holder(), None);
		assert!(lock.try_acquire("b").is_some());
	}

	#[tokio::test]
	async fn test_waiters_are_served_in_order() {
		let lock = WriterLock::new();
		let first = lock.acquire("first").await.unwrap();
		let (tx, mut rx) = mpsc::unbounded_channel();

		let mut pending = Vec::new();
		for name in ["second", "third"] {
			let tx = tx.clone();
			pending.push(PendingLock::spawn(lock.clone(), name.to_string(), move |permit| async move {
				let permit = permit.unwrap();
				tx.send(format!("{} start", permit.holder())).unwrap();
				tokio::time::sleep(Duration::from_millis(10)).await;
				tx.send(format!("{} end", permit.holder())).unwrap();
			}));
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		assert!(rx.try_recv().is_err());
		drop(first);

		let mut order = Vec::new();
		for _ in 0..4 {
			order.push(rx.recv().await.unwrap());
		}
		assert_eq!(order, vec!["second start", "second end", "third start", "third end"]);
	}

	#[tokio::test]
	async fn test_cancel_while_waiting_frees_the_slot() {
		let lock = WriterLock::new();
		let first = lock.acquire("first").await.unwrap();

		let (tx, rx) = oneshot::channel::<()>();
		let waiting = PendingLock::spawn(lock.clone(), "waiter".into(), move |_| async move {
			let _ = tx.send(());
		});
		tokio::time::sleep(Duration::from_millis(10)).await;

		assert!(waiting.cancel());
		drop(first);

		// the cancelled waiter never ran and the lock is free again
		assert!(rx.await.is_err());
		assert!(lock.acquire("next").await.is_ok());
	}

	#[tokio::test]
	async fn test_cancel_after_grant_is_refused() {
		let lock = WriterLock::new();
		let (tx, rx) = oneshot::channel::<()>();
		let running = PendingLock::spawn(lock.clone(), "sender".into(), move |permit| async move {
			let _permit = permit.unwrap();
			let _ = rx.await;
		});
		tokio::time::sleep(Duration::from_millis(10)).await;

		assert!(running.is_granted());
		assert!(!running.cancel());
		tx.send(()).unwrap();
	}

	#[tokio::test]
	async fn test_closed_lock_fails_waiters() {
		let lock = WriterLock::new();
		let _held = lock.acquire("a").await.unwrap();
		let other = lock.clone();
		let waiter = tokio::spawn(async move { other.acquire("b").await.is_err() });
		tokio::time::sleep(Duration::from_millis(10)).await;
		lock.close();
		assert!(waiter.await.unwrap());
	}
}

// vim: ts=4
