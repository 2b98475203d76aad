//! Client configuration
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (`.toml`, anything else is read as JSON5)
//! 3. Environment variables (FCPR_* prefix)
//! 4. CLI flags (applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::connection::{SessionOptions, TcpConnector};
use crate::error::{FcpError, FcpResult};
use crate::transfer::{Persistence, DEFAULT_PRIORITY, MAX_PRIORITY};

/// Default FCP port of a node
pub const DEFAULT_PORT: u16 = 9481;

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// NODE
	// ========================================================================
	pub host: String,

	pub port: u16,

	/// Name announced in ClientHello; also prefixes every identifier
	pub client_name: String,

	/// Fetch finished downloads of the global queue automatically
	pub auto_download: bool,

	// ========================================================================
	// LOCATIONS
	// ========================================================================
	/// Where downloads are written when no destination is given
	pub download_dir: PathBuf,

	/// Queue store and other state (~/.fcpr)
	pub state_dir: PathBuf,

	// ========================================================================
	// TRANSFER DEFAULTS
	// ========================================================================
	/// Priority class, 0 (most urgent) to 6
	pub priority: u8,

	pub persistence: Persistence,

	/// Put requests on the node's global queue
	pub global: bool,

	/// -1 retries forever
	pub max_retries: i32,

	pub compress: bool,

	/// Codec list passed as `Codecs` (node default when absent)
	pub codec: Option<String>,

	// ========================================================================
	// OUTPUT & LOGGING
	// ========================================================================
	/// Log level (trace, debug, info, warn, error)
	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		let home = std::env::var("HOME").ok().map(PathBuf::from);
		Config {
			host: "127.0.0.1".to_string(),
			port: DEFAULT_PORT,
			client_name: "fcpr".to_string(),
			auto_download: false,

			download_dir: home.clone().map(|h| h.join("Downloads")).unwrap_or_else(|| PathBuf::from(".")),
			state_dir: home.map(|h| h.join(".fcpr")).unwrap_or_else(|| PathBuf::from(".fcpr")),

			priority: DEFAULT_PRIORITY,
			persistence: Persistence::Forever,
			global: true,
			max_retries: -1,
			compress: true,
			codec: None,

			log_level: "info".to_string(),
		}
	}
}

impl Config {
	/// Defaults, overlaid with `path` when given, then with the environment
	pub fn load(path: Option<&Path>) -> FcpResult<Config> {
		let mut config = match path {
			Some(path) => Config::from_file(path)?,
			None => Config::default(),
		};
		config.apply_env(|name| std::env::var(name).ok())?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: &Path) -> FcpResult<Config> {
		let content = std::fs::read_to_string(path)?;
		let is_toml = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("toml"));
		debug!("Reading configuration from {}", path.display());
		if is_toml {
			Config::from_toml(&content)
		} else {
			Config::from_json5(&content)
		}
	}

	pub fn from_toml(content: &str) -> FcpResult<Config> {
		toml::from_str(content).map_err(|e| FcpError::Config { message: e.to_string() })
	}

	pub fn from_json5(content: &str) -> FcpResult<Config> {
		json5::from_str(content).map_err(|e| FcpError::Config { message: e.to_string() })
	}

	/// Overlay `FCPR_*` variables; `lookup` returns a variable's value
	pub fn apply_env<F>(&mut self, lookup: F) -> FcpResult<()>
	where
		F: Fn(&str) -> Option<String>,
	{
		fn parsed<T: std::str::FromStr>(name: &str, value: &str) -> FcpResult<T> {
			value
				.trim()
				.parse()
				.map_err(|_| FcpError::Config { message: format!("{}: invalid value '{}'", name, value) })
		}
		fn flag(name: &str, value: &str) -> FcpResult<bool> {
			match value.trim().to_ascii_lowercase().as_str() {
				"1" | "true" | "yes" | "on" => Ok(true),
				"0" | "false" | "no" | "off" => Ok(false),
				_ => Err(FcpError::Config { message: format!("{}: invalid value '{}'", name, value) }),
			}
		}

		if let Some(v) = lookup("FCPR_HOST") {
			self.host = v;
		}
		if let Some(v) = lookup("FCPR_PORT") {
			self.port = parsed("FCPR_PORT", &v)?;
		}
		if let Some(v) = lookup("FCPR_CLIENT_NAME") {
			self.client_name = v;
		}
		if let Some(v) = lookup("FCPR_AUTO_DOWNLOAD") {
			self.auto_download = flag("FCPR_AUTO_DOWNLOAD", &v)?;
		}
		if let Some(v) = lookup("FCPR_DOWNLOAD_DIR") {
			self.download_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup("FCPR_STATE_DIR") {
			self.state_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup("FCPR_PRIORITY") {
			self.priority = parsed("FCPR_PRIORITY", &v)?;
		}
		if let Some(v) = lookup("FCPR_PERSISTENCE") {
			self.persistence = Persistence::from_fcp(&v);
		}
		if let Some(v) = lookup("FCPR_GLOBAL") {
			self.global = flag("FCPR_GLOBAL", &v)?;
		}
		if let Some(v) = lookup("FCPR_MAX_RETRIES") {
			self.max_retries = parsed("FCPR_MAX_RETRIES", &v)?;
		}
		if let Some(v) = lookup("FCPR_COMPRESS") {
			self.compress = flag("FCPR_COMPRESS", &v)?;
		}
		if let Some(v) = lookup("FCPR_CODEC") {
			self.codec = Some(v).filter(|c| !c.is_empty());
		}
		if let Some(v) = lookup("FCPR_LOG_LEVEL") {
			self.log_level = v;
		}
		Ok(())
	}

	pub fn validate(&self) -> FcpResult<()> {
		if self.priority > MAX_PRIORITY {
			return Err(FcpError::Config {
				message: format!("priority {} out of range (0-{})", self.priority, MAX_PRIORITY),
			});
		}
		if self.port == 0 {
			return Err(FcpError::Config { message: "port must not be 0".to_string() });
		}
		if self.client_name.trim().is_empty() {
			return Err(FcpError::Config { message: "client name must not be empty".to_string() });
		}
		Ok(())
	}

	pub fn connector(&self) -> TcpConnector {
		TcpConnector::new(self.host.clone(), self.port)
	}

	pub fn session_options(&self) -> SessionOptions {
		let mut options = SessionOptions::new(self.client_name.clone());
		options.local = self.connector().is_local();
		options.auto_download = self.auto_download;
		options
	}

	/// Location of the queue store
	pub fn queue_path(&self) -> PathBuf {
		self.state_dir.join("queue.redb")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.host, "127.0.0.1");
		assert_eq!(config.port, 9481);
		assert_eq!(config.priority, 4);
		assert_eq!(config.max_retries, -1);
		assert_eq!(config.persistence, Persistence::Forever);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_toml_and_json5() {
		let config = Config::from_toml("host = \"node.lan\"\nport = 9000\npersistence = \"reboot\"\n").unwrap();
		assert_eq!(config.host, "node.lan");
		assert_eq!(config.port, 9000);
		assert_eq!(config.persistence, Persistence::UntilNodeReboot);
		assert_eq!(config.client_name, "fcpr");

		let config = Config::from_json5("{ clientName: 'frost', maxRetries: 3, codec: 'LZMA_NEW', }").unwrap();
		assert_eq!(config.client_name, "frost");
		assert_eq!(config.max_retries, 3);
		assert_eq!(config.codec.as_deref(), Some("LZMA_NEW"));
	}

	#[test]
	fn test_env_overrides() {
		let env: HashMap<&str, &str> =
			[("FCPR_PORT", "9999"), ("FCPR_GLOBAL", "no"), ("FCPR_PERSISTENCE", "connection")].into();
		let mut config = Config::default();
		config.apply_env(|name| env.get(name).map(|v| v.to_string())).unwrap();
		assert_eq!(config.port, 9999);
		assert!(!config.global);
		assert_eq!(config.persistence, Persistence::UntilDisconnect);

		let mut config = Config::default();
		assert!(config.apply_env(|name| (name == "FCPR_PORT").then(|| "x".to_string())).is_err());
	}

	#[test]
	fn test_validation() {
		let mut config = Config::default();
		config.priority = 7;
		assert!(matches!(config.validate(), Err(FcpError::Config { .. })));

		let mut config = Config::default();
		config.port = 0;
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_load_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("fcpr.json5");
		std::fs::write(&path, "{ priority: 2, stateDir: '/tmp/fcpr-state' }").unwrap();
		let config = Config::from_file(&path).unwrap();
		assert_eq!(config.priority, 2);
		assert_eq!(config.queue_path(), PathBuf::from("/tmp/fcpr-state/queue.redb"));
	}
}

// vim: ts=4
