//! Key string helpers
//!
//! Pure transforms over the four key families:
//! - `CHK@<routing>,<crypto>,<extra>/<filename>`: content hash keys
//! - `KSK@<name>`: keyword signed keys
//! - `SSK@<routing>,<crypto>,<extra>/<name>-<rev>/...`: signed subspace keys
//! - `USK@<routing>,<crypto>,<extra>/<name>/<rev>/...`: updatable subspace keys
//!
//! Path segments are split the way the node's own tools split them: trailing
//! empty segments are dropped, so `SSK@.../site-5/` has two segments.

use percent_encoding::percent_decode_str;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)((CHK|SSK|USK)@[a-z0-9~-]{43},[a-z0-9~-]{43},[a-z0-9~-]{7}.*)|(KSK@.+)")
		.expect("key regex is valid")
});

// '.' deliberately matches any character here
static FRDX_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(".frdx").expect("frdx regex is valid"));

/// Number of leading characters that identify a non-KSK key
const COMPARABLE_LEN: usize = 70;

/// Key family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
	Chk,
	Ksk,
	Ssk,
	Usk,
}

impl KeyType {
	/// Detect the family from the key prefix
	pub fn of(key: &str) -> Option<KeyType> {
		match key.get(..4) {
			Some("CHK@") => Some(KeyType::Chk),
			Some("KSK@") => Some(KeyType::Ksk),
			Some("SSK@") => Some(KeyType::Ssk),
			Some("USK@") => Some(KeyType::Usk),
			_ => None,
		}
	}

	/// Numeric code used in persisted parameters
	pub fn code(&self) -> i32 {
		match self {
			KeyType::Chk => 0,
			KeyType::Ksk => 1,
			KeyType::Ssk => 2,
			KeyType::Usk => 3,
		}
	}

	/// Inverse of [`KeyType::code`]
	pub fn from_code(code: i32) -> Option<KeyType> {
		match code {
			0 => Some(KeyType::Chk),
			1 => Some(KeyType::Ksk),
			2 => Some(KeyType::Ssk),
			3 => Some(KeyType::Usk),
			_ => None,
		}
	}

	/// `CHK@`, `KSK@`, ...
	pub fn prefix(&self) -> &'static str {
		match self {
			KeyType::Chk => "CHK@",
			KeyType::Ksk => "KSK@",
			KeyType::Ssk => "SSK@",
			KeyType::Usk => "USK@",
		}
	}

	/// SSK and USK inserts need a keypair
	pub fn needs_keypair(&self) -> bool {
		matches!(self, KeyType::Ssk | KeyType::Usk)
	}
}

impl fmt::Display for KeyType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.prefix()[..3])
	}
}

/// Split that drops trailing empty pieces (but keeps a lone empty string)
fn split_segments(s: &str, sep: char) -> Vec<&str> {
	let mut parts: Vec<&str> = s.split(sep).collect();
	if s.is_empty() {
		return parts;
	}
	while parts.last().is_some_and(|p| p.is_empty()) {
		parts.pop();
	}
	parts
}

/// Form-style URL decoding: `+` is a space, `%XX` an escaped byte
pub fn url_decode(s: &str) -> String {
	let spaced = s.replace('+', " ");
	percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Quick check on the key head (the body is not validated)
pub fn is_key(key: &str) -> bool {
	if key.starts_with("CHK@") || key.starts_with("SSK@") || key.starts_with("USK@") {
		return key.len() > 20;
	}
	key.starts_with("KSK@")
}

/// Extract a key from pasted text (URL-encoded, behind a gateway URL, ...)
pub fn clean_uri(uri: &str) -> Option<String> {
	let decoded = url_decode(uri);
	match KEY_RE.find(&decoded) {
		Some(found) if is_key(found.as_str()) => Some(found.as_str().to_string()),
		_ => {
			debug!("Not a valid key: {}", decoded);
			None
		}
	}
}

/// Filename a download of this key would naturally get
pub fn filename_from_key(key: &str) -> Option<String> {
	let filename = if key.starts_with("KSK") {
		key.get(4..).map(str::to_string)
	} else {
		let segments = split_segments(key, '/');
		let n = segments.len();

		if key.starts_with("CHK") {
			if n >= 2 {
				Some(segments[1].to_string())
			} else {
				None
			}
		} else if key.starts_with("SSK") {
			segments.last().map(|s| s.to_string())
		} else if key.starts_with("USK") {
			match n {
				2 | 3 => Some(segments[1].to_string()),
				n if n >= 4 => Some(segments[n - 1].to_string()),
				_ => None,
			}
		} else {
			None
		}
	};

	filename.map(|f| url_decode(&f))
}

/// `SSK@.../name-rev/...` to `USK@.../name/rev/...`
pub fn convert_ssk_to_usk(key: &str) -> String {
	if key.starts_with("USK@") {
		return key.to_string();
	}

	let key = key.replacen("SSK@", "USK@", 1);
	let segments = split_segments(&key, '/');

	let mut out = String::with_capacity(key.len() + 2);
	for (i, segment) in segments.iter().enumerate() {
		match i {
			0 => out.push_str(segment),
			1 => {
				let pieces = split_segments(segment, '-');
				out.push('/');
				match pieces.split_last() {
					Some((rev, name)) if !name.is_empty() => {
						out.push_str(&name.join("-"));
						out.push('/');
						out.push_str(rev);
					}
					_ => {
						out.push_str(segment);
						out.push_str("/0");
					}
				}
			}
			_ => {
				out.push('/');
				out.push_str(segment);
			}
		}
	}
	out
}

/// `USK@.../name/rev/...` to `SSK@.../name-rev/...`. The revision sign is
/// not carried over: `-44` becomes `name-44`.
pub fn convert_usk_to_ssk(key: &str) -> String {
	if key.starts_with("SSK@") {
		return key.to_string();
	}

	let key = key.replacen("USK@", "SSK@", 1);
	let segments = split_segments(&key, '/');

	let mut out = String::with_capacity(key.len());
	for (i, segment) in segments.iter().enumerate() {
		match i {
			0 => out.push_str(segment),
			2 => {
				out.push('-');
				out.push_str(&abs_revision(segment));
			}
			_ => {
				out.push('/');
				out.push_str(segment);
			}
		}
	}
	out
}

fn abs_revision(rev: &str) -> String {
	match rev.trim().parse::<i64>() {
		Ok(value) => value.unsigned_abs().to_string(),
		Err(_) => {
			warn!("Unparsable revision '{}'", rev);
			"0".to_string()
		}
	}
}

/// Key under which an SSK/USK is inserted, without its trailing filename
pub fn public_insertion_ssk(key: &str) -> String {
	let ssk = convert_usk_to_ssk(key);
	let segments = split_segments(&ssk, '/');
	let keep = segments.len().saturating_sub(1);
	segments[..keep].join("/")
}

fn change_rev(current: &str, rev: i64, offset: i64) -> String {
	if offset == 0 {
		return rev.to_string();
	}
	let current = current.trim().parse::<i64>().unwrap_or_else(|_| {
		warn!("Unparsable revision '{}', counting from 0", current);
		0
	});
	(current + offset).to_string()
}

/// Rewrite the revision of an SSK (`name-rev` segment): set it to `rev` when
/// `offset` is 0, otherwise add `offset` to it. A segment without a dash is
/// a bare revision, appended to the key itself.
pub fn change_ssk_revision(key: &str, rev: i64, offset: i64) -> String {
	let segments = split_segments(key, '/');

	let mut out = String::with_capacity(key.len() + 4);
	for (i, segment) in segments.iter().enumerate() {
		match i {
			0 => out.push_str(segment),
			1 => {
				let pieces = split_segments(segment, '-');
				out.push('/');
				match pieces.split_last() {
					Some((current, name)) if !name.is_empty() => {
						out.push_str(&name.join("-"));
						out.push('-');
						out.push_str(&change_rev(current, rev, offset));
					}
					_ => {
						out.pop();
						out.push('-');
						out.push_str(&change_rev(segment, rev, offset));
					}
				}
			}
			_ => {
				out.push('/');
				out.push_str(segment);
			}
		}
	}
	out
}

/// Same as [`change_ssk_revision`] for a USK (`/name/rev` segments)
pub fn change_usk_revision(key: &str, rev: i64, offset: i64) -> String {
	let segments = split_segments(key, '/');

	let mut out = String::with_capacity(key.len() + 4);
	for (i, segment) in segments.iter().enumerate() {
		match i {
			0 => out.push_str(segment),
			2 => {
				out.push('/');
				out.push_str(&change_rev(segment, rev, offset));
			}
			_ => {
				out.push('/');
				out.push_str(segment);
			}
		}
	}
	out
}

/// Revision of a USK, -1 when absent or unparsable
pub fn usk_revision(key: &str) -> i64 {
	let segments = split_segments(key, '/');
	if segments.len() < 3 {
		return -1;
	}
	segments[2].trim().parse().unwrap_or_else(|_| {
		warn!("Unable to parse revision of '{}'", key);
		-1
	})
}

/// Lowercased identifying head of a key (whole key for KSK)
pub fn comparable_part(key: &str) -> String {
	if key.starts_with("KSK@") {
		return key.to_lowercase();
	}
	key.chars().take(COMPARABLE_LEN).collect::<String>().to_lowercase()
}

/// Do two keys designate the same content, revisions ignored?
///
/// When the SSK forms have a different number of path segments, only the
/// key and the first path segment are compared, so an index key matches the
/// same index with a filename appended.
pub fn compare_keys(a: &str, b: &str) -> bool {
	if a == b {
		return true;
	}

	let (Some(mut a), Some(mut b)) = (clean_uri(a), clean_uri(b)) else {
		return false;
	};

	if a.starts_with("USK@") {
		a = convert_usk_to_ssk(&a);
	}
	if b.starts_with("USK@") {
		b = convert_usk_to_ssk(&b);
	}

	if a.get(..3) != b.get(..3) {
		debug!("Not the same kind of key: {:?} vs {:?}", a.get(..3), b.get(..3));
		return false;
	}

	if a.starts_with("CHK@") {
		return comparable_part(&a) == comparable_part(&b);
	}

	if a.starts_with("SSK@") {
		a = change_ssk_revision(&a, 0, 0);
		b = change_ssk_revision(&b, 0, 0);

		let seg_a = split_segments(&a, '/');
		let seg_b = split_segments(&b, '/');
		if seg_a.len() != seg_b.len() {
			let head = |s: &[&str]| s.iter().take(2).copied().collect::<String>();
			let (short_a, short_b) = (head(&seg_a), head(&seg_b));
			a = short_a;
			b = short_b;
		}

		a = FRDX_RE.replace_all(&a, ".xml").into_owned();
		b = FRDX_RE.replace_all(&b, ".xml").into_owned();
	}

	a == b
}

/// Keys produced by outdated node versions
pub fn is_obsolete(key: &str) -> bool {
	if key.starts_with("KSK") {
		return false;
	}
	if key.starts_with("SSK") || key.starts_with("USK") {
		return key.find("AQABAAE").is_some_and(|idx| idx > 0);
	}
	if key.starts_with("CHK") {
		return key.find(",AAE").is_some_and(|idx| idx > 0);
	}
	true
}


// vim: ts=4
