//! On-disk queue store
//!
//! Keeps the parameter map of every queued transfer so the queue can be
//! rebuilt after a restart.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::FcpResult;
use crate::transfer::{Parameters, TransferKind};

/// Key: queue position, zero padded so the table iterates in queue order
/// Value: serialized StoredTransfer (bytes)
const TRANSFERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("transfers");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransfer {
	#[serde(rename = "k")]
	pub kind: TransferKind,
	#[serde(rename = "p")]
	pub parameters: Parameters,
}

pub struct QueueStore {
	db: redb::Database,
	path: PathBuf,
}

impl QueueStore {
	/// Open or create the store at `path`
	pub fn open(path: &Path) -> FcpResult<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db = redb::Database::create(path)?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(TRANSFERS_TABLE)?;
			write_txn.commit()?;
		}
		Ok(QueueStore { db, path: path.to_path_buf() })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Replace the stored queue with `entries`
	pub fn replace_all(&self, entries: &[(TransferKind, Parameters)]) -> FcpResult<()> {
		let write_txn = self.db.begin_write()?;
		{
			write_txn.delete_table(TRANSFERS_TABLE)?;
			let mut table = write_txn.open_table(TRANSFERS_TABLE)?;
			for (position, (kind, parameters)) in entries.iter().enumerate() {
				let stored = StoredTransfer { kind: *kind, parameters: parameters.clone() };
				let bytes = serde_json::to_vec(&stored)?;
				table.insert(format!("{:08}", position).as_str(), bytes.as_slice())?;
			}
		}
		write_txn.commit()?;
		debug!("{} transfers written to {}", entries.len(), self.path.display());
		Ok(())
	}

	/// Every stored transfer, in queue order
	pub fn load(&self) -> FcpResult<Vec<StoredTransfer>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(TRANSFERS_TABLE)?;

		let mut stored = Vec::new();
		for entry in table.iter()? {
			let (_, value) = entry?;
			stored.push(serde_json::from_slice(value.value())?);
		}
		Ok(stored)
	}
}


// vim: ts=4
