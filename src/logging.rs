//! Logging setup
//!
//! The engine itself only emits `tracing` events; binaries install a
//! subscriber with [`init_tracing`].

/// Initialize the tracing subscriber with environment filter support.
///
/// `default_level` applies when `RUST_LOG` is unset or invalid:
///
/// ```bash
/// RUST_LOG=debug fcpr get KSK@gpl.txt
/// RUST_LOG=fcpr::connection=debug,fcpr::client_put=trace fcpr put file.bin
/// ```
pub fn init_tracing(default_level: &str) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
	// a subscriber may already be installed (tests, embedding applications)
	let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

// vim: ts=4
