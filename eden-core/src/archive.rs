//! The `.edenite` archive format: `(u32 BE metadata_len)(metadata json)(zstd-compressed tar)`.
//!
//! This is the one external collaborator SPEC_FULL asks us to actually
//! implement both directions of, since the install/build round trip (S8)
//! can't be exercised against a trait stub.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ArchiveError;
use crate::manifest::Manifest;

pub const ARCHIVE_EXTENSION: &str = "edenite";
const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
	pub version: u32,
	pub checksum: String,
	pub created: String,
	pub manifest: Manifest,
}

/// A decoded archive, ready for the Package Store to extract.
pub struct DecodedArchive {
	pub metadata: ArchiveMetadata,
	/// Decompressed tar bytes; the package store streams these out to
	/// `user_apps_dir/<id>/`.
	pub tar_bytes: Vec<u8>,
}

/// Reads and verifies a `.edenite` file's header, re-hashing the
/// compressed block and rejecting on checksum mismatch. Does not touch
/// the filesystem beyond its own input bytes — callers `spawn_blocking`
/// the actual file read, per the worker-thread offload rule in spec §5.
pub fn decode(bytes: &[u8]) -> Result<DecodedArchive, ArchiveError> {
	if bytes.len() < 4 {
		return Err(ArchiveError::BadMetadata("archive shorter than header".into()));
	}
	let metadata_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
	let metadata_start = 4;
	let metadata_end = metadata_start
		.checked_add(metadata_len)
		.filter(|&end| end <= bytes.len())
		.ok_or_else(|| ArchiveError::BadMetadata("metadata length exceeds archive size".into()))?;

	let metadata_json = std::str::from_utf8(&bytes[metadata_start..metadata_end])
		.map_err(|e| ArchiveError::BadMetadata(format!("metadata is not valid UTF-8: {e}")))?;
	let metadata: ArchiveMetadata = serde_json::from_str(metadata_json)?;

	let compressed = &bytes[metadata_end..];
	let computed = hex_sha256(compressed);
	if computed != metadata.checksum {
		return Err(ArchiveError::ChecksumMismatch { expected: metadata.checksum.clone(), computed });
	}

	metadata.manifest.validate().map_err(|e| ArchiveError::InvalidManifest(e.to_string()))?;

	let tar_bytes = zstd::stream::decode_all(Cursor::new(compressed))?;
	Ok(DecodedArchive { metadata, tar_bytes })
}

/// Streams every regular file out of a decoded archive's tar bytes into
/// `dest_dir`, creating parent directories as needed.
pub fn extract_files(tar_bytes: &[u8], dest_dir: &Path) -> Result<(), ArchiveError> {
	let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
	std::fs::create_dir_all(dest_dir)?;
	archive.unpack(dest_dir)?;
	Ok(())
}

/// Builds a `.edenite` archive from a directory containing `manifest.json`
/// plus app files. Used by the CLI's `build` subcommand and by tests
/// exercising the install round trip (S8).
pub fn build(source_dir: &Path, compression_level: i32) -> Result<Vec<u8>, ArchiveError> {
	let manifest_path = source_dir.join("manifest.json");
	let manifest_json = std::fs::read_to_string(&manifest_path)?;
	let manifest: Manifest = serde_json::from_str(&manifest_json)?;
	manifest.validate().map_err(|e| ArchiveError::InvalidManifest(e.to_string()))?;

	let mut tar_bytes = Vec::new();
	{
		let mut builder = tar::Builder::new(&mut tar_bytes);
		builder.append_dir_all(".", source_dir)?;
		builder.finish()?;
	}

	let compressed = zstd::stream::encode_all(Cursor::new(&tar_bytes), compression_level.clamp(1, 22))?;
	let checksum = hex_sha256(&compressed);

	let metadata = ArchiveMetadata {
		version: METADATA_VERSION,
		checksum,
		created: now_iso8601(),
		manifest,
	};
	let metadata_json = serde_json::to_vec(&metadata)?;

	let mut out = Vec::with_capacity(4 + metadata_json.len() + compressed.len());
	out.extend_from_slice(&(metadata_json.len() as u32).to_be_bytes());
	out.extend_from_slice(&metadata_json);
	out.extend_from_slice(&compressed);
	Ok(out)
}

/// Validates a directory as a would-be archive source without building
/// anything: manifest present, parses, and passes [`Manifest::validate`].
pub fn validate_source(source_dir: &Path) -> Result<Manifest, ArchiveError> {
	let manifest_path = source_dir.join("manifest.json");
	if !manifest_path.exists() {
		return Err(ArchiveError::InvalidManifest(format!("{} is missing manifest.json", source_dir.display())));
	}
	let manifest_json = std::fs::read_to_string(&manifest_path)?;
	let manifest: Manifest = serde_json::from_str(&manifest_json)?;
	manifest.validate().map_err(|e| ArchiveError::InvalidManifest(e.to_string()))?;

	if !FrontendEntryLocal::exists_or_remote(source_dir, &manifest.frontend.entry) {
		return Err(ArchiveError::InvalidManifest(format!("frontend entry `{}` not found under {}", manifest.frontend.entry, source_dir.display())));
	}
	if let Some(backend) = &manifest.backend {
		if !source_dir.join(&backend.entry).exists() {
			return Err(ArchiveError::InvalidManifest(format!("backend entry `{}` not found under {}", backend.entry, source_dir.display())));
		}
	}
	Ok(manifest)
}

struct FrontendEntryLocal;
impl FrontendEntryLocal {
	fn exists_or_remote(source_dir: &Path, entry: &str) -> bool {
		if crate::manifest::FrontendEntry::is_url_like(entry) {
			url::Url::parse(entry).is_ok()
		} else {
			source_dir.join(entry).exists()
		}
	}
}

pub fn has_archive_extension(path: &Path) -> bool {
	path.extension().and_then(|e| e.to_str()).map(|e| e == ARCHIVE_EXTENSION).unwrap_or(false)
}

fn hex_sha256(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	let digest = hasher.finalize();
	let mut s = String::with_capacity(digest.len() * 2);
	for byte in digest {
		use std::fmt::Write as _;
		write!(s, "{byte:02x}").expect("writing to a String cannot fail");
	}
	s
}

/// Current UTC time as an ISO-8601 / RFC 3339 string, the format
/// `ArchiveMetadata.created` is documented to carry.
fn now_iso8601() -> String {
	chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Reads raw archive info without extracting: the CLI's `info` subcommand.
pub fn peek(bytes: &[u8]) -> Result<ArchiveMetadata, ArchiveError> {
	Ok(decode(bytes)?.metadata)
}

pub fn read_file(path: &Path) -> Result<Vec<u8>, ArchiveError> {
	if !has_archive_extension(path) {
		return Err(ArchiveError::WrongExtension(path.to_path_buf()));
	}
	Ok(std::fs::read(path)?)
}

pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let mut file = std::fs::File::create(path)?;
	file.write_all(bytes)
}
