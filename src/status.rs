//! Transfer status lattice shared by downloads and uploads

use serde::{Deserialize, Serialize};
use std::fmt;

/// `NotRunning -> Running -> {Failed, Successful}`
///
/// Terminal states are never left: a restart is a new attempt that begins
/// again from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferStatus {
	#[default]
	NotRunning,
	Running,
	Failed,
	Successful,
}

impl TransferStatus {
	pub fn is_running(&self) -> bool {
		matches!(self, TransferStatus::Running)
	}

	pub fn is_finished(&self) -> bool {
		matches!(self, TransferStatus::Failed | TransferStatus::Successful)
	}

	pub fn is_successful(&self) -> bool {
		matches!(self, TransferStatus::Successful)
	}

	/// Rebuild from the three persisted flags. `running` wins over the others.
	pub fn from_flags(running: bool, finished: bool, successful: bool) -> TransferStatus {
		match (running, finished, successful) {
			(true, _, _) => TransferStatus::Running,
			(false, true, true) => TransferStatus::Successful,
			(false, true, false) => TransferStatus::Failed,
			(false, false, _) => TransferStatus::NotRunning,
		}
	}
}

impl fmt::Display for TransferStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TransferStatus::NotRunning => "not running",
			TransferStatus::Running => "running",
			TransferStatus::Failed => "failed",
			TransferStatus::Successful => "successful",
		};
		f.write_str(s)
	}
}


// vim: ts=4
