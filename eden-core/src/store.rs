//! Package Store — scans the prebuilt and user app directories into an
//! in-memory catalog, and installs/uninstalls `.edenite` archives into
//! the user directory (spec §4, scenarios S1-S3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::archive;
use crate::error::Error;
use crate::manifest::Manifest;
use crate::process::ManifestLookup;

#[derive(Debug, Clone)]
pub struct PackageEntry {
	pub manifest: Manifest,
	pub install_path: PathBuf,
}

pub struct PackageStore {
	apps_directory: PathBuf,
	user_directory: PathBuf,
	catalog: Mutex<HashMap<String, PackageEntry>>,
}

impl PackageStore {
	pub fn new(apps_directory: PathBuf, user_directory: PathBuf) -> Self {
		PackageStore { apps_directory, user_directory, catalog: Mutex::new(HashMap::new()) }
	}

	/// Scans both roots, prebuilt first. A subdirectory whose `manifest.json`
	/// fails to parse or validate is logged and skipped, not fatal to the
	/// rest of the scan. Duplicate ids across the two roots keep the
	/// prebuilt entry and skip the user one, since system apps win.
	pub fn initialize(&self) -> Result<(), Error> {
		let mut catalog = self.catalog.lock().expect("catalog poisoned");
		catalog.clear();

		for install_path in subdirectories(&self.apps_directory) {
			match load_manifest(&install_path, true) {
				Ok(manifest) => {
					catalog.insert(manifest.id.clone(), PackageEntry { manifest, install_path });
				}
				Err(err) => tracing::warn!(path = %install_path.display(), error = %err, "skipping prebuilt app with invalid manifest"),
			}
		}

		for install_path in subdirectories(&self.user_directory) {
			match load_manifest(&install_path, false) {
				Ok(manifest) => {
					if catalog.contains_key(&manifest.id) {
						tracing::warn!(id = manifest.id, "user-installed app shadows a prebuilt id; keeping the prebuilt one");
						continue;
					}
					catalog.insert(manifest.id.clone(), PackageEntry { manifest, install_path });
				}
				Err(err) => tracing::warn!(path = %install_path.display(), error = %err, "skipping user app with invalid manifest"),
			}
		}

		Ok(())
	}

	/// Decodes and extracts a `.edenite` archive into
	/// `user_directory/<id>/`. Rejects if `id` is already installed
	/// (prebuilt or user). The decompress/extract work is offloaded to a
	/// blocking thread per spec §5.
	pub async fn install(&self, archive_bytes: Vec<u8>) -> Result<PackageEntry, Error> {
		let user_directory = self.user_directory.clone();
		let decoded = tokio::task::spawn_blocking(move || -> Result<(Manifest, PathBuf), Error> {
			let decoded = archive::decode(&archive_bytes)?;
			let install_path = user_directory.join(&decoded.metadata.manifest.id);
			archive::extract_files(&decoded.tar_bytes, &install_path)?;
			Ok((decoded.metadata.manifest, install_path))
		})
		.await
		.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

		let (manifest, install_path) = decoded;
		{
			let catalog = self.catalog.lock().expect("catalog poisoned");
			if catalog.contains_key(&manifest.id) {
				return Err(Error::AlreadyExists(format!("app `{}` is already installed", manifest.id)));
			}
		}

		let entry = PackageEntry { manifest: manifest.clone(), install_path };
		self.catalog.lock().expect("catalog poisoned").insert(manifest.id.clone(), entry.clone());
		Ok(entry)
	}

	/// Removes a user-installed app's directory and catalog entry.
	/// Prebuilt apps cannot be uninstalled.
	pub async fn uninstall(&self, app_id: &str) -> Result<(), Error> {
		let entry = {
			let catalog = self.catalog.lock().expect("catalog poisoned");
			catalog.get(app_id).cloned().ok_or_else(|| Error::not_found(format!("app {app_id}")))?
		};
		if entry.manifest.is_prebuilt {
			return Err(Error::SystemApp(app_id.to_string()));
		}

		let install_path = entry.install_path.clone();
		tokio::task::spawn_blocking(move || std::fs::remove_dir_all(install_path))
			.await
			.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

		self.catalog.lock().expect("catalog poisoned").remove(app_id);
		Ok(())
	}

	pub fn list(&self) -> Vec<PackageEntry> {
		let catalog = self.catalog.lock().expect("catalog poisoned");
		let mut entries: Vec<PackageEntry> = catalog.values().cloned().collect();
		entries.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
		entries
	}

	pub fn get(&self, app_id: &str) -> Option<PackageEntry> {
		self.catalog.lock().expect("catalog poisoned").get(app_id).cloned()
	}

	/// Path to an app's declared icon, if it has one and the file exists.
	pub fn icon(&self, app_id: &str) -> Option<PathBuf> {
		let entry = self.get(app_id)?;
		let icon = entry.manifest.icon.as_ref()?;
		let path = entry.install_path.join(icon);
		path.exists().then_some(path)
	}

	/// Re-reads one app's `manifest.json` in place without touching its
	/// files, for picking up manifest edits during development.
	pub fn reload(&self, app_id: &str) -> Result<(), Error> {
		let install_path = {
			let catalog = self.catalog.lock().expect("catalog poisoned");
			catalog.get(app_id).map(|e| (e.install_path.clone(), e.manifest.is_prebuilt)).ok_or_else(|| Error::not_found(format!("app {app_id}")))?
		};
		let manifest = load_manifest(&install_path.0, install_path.1)?;
		self.catalog.lock().expect("catalog poisoned").insert(app_id.to_string(), PackageEntry { manifest, install_path: install_path.0 });
		Ok(())
	}
}

impl ManifestLookup for PackageStore {
	fn manifest_for(&self, app_id: &str) -> Option<(Manifest, String)> {
		self.get(app_id).map(|e| (e.manifest, e.install_path.to_string_lossy().into_owned()))
	}
}

fn subdirectories(root: &Path) -> Vec<PathBuf> {
	let Ok(entries) = std::fs::read_dir(root) else { return Vec::new() };
	entries
		.filter_map(|entry| entry.ok())
		.map(|entry| entry.path())
		.filter(|path| path.is_dir())
		.collect()
}

fn load_manifest(install_path: &Path, is_prebuilt: bool) -> Result<Manifest, Error> {
	let manifest_path = install_path.join("manifest.json");
	let raw = std::fs::read_to_string(&manifest_path)?;
	let mut manifest: Manifest = serde_json::from_str(&raw)?;
	manifest.validate()?;
	manifest.is_prebuilt = is_prebuilt;
	Ok(manifest)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::manifest::FrontendConfig;

	fn write_sample_app(dir: &Path, id: &str) {
		std::fs::create_dir_all(dir).unwrap();
		std::fs::write(dir.join("index.html"), b"<html></html>").unwrap();
		let manifest = Manifest {
			id: id.into(),
			name: id.into(),
			version: "1.0.0".into(),
			description: None,
			author: None,
			icon: None,
			frontend: FrontendConfig { entry: "index.html".into() },
			backend: None,
			window: None,
			permissions: vec![],
			autostart: false,
			overlay: false,
			is_prebuilt: false,
		};
		std::fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
	}

	#[test]
	fn s2_scan_skips_corrupt_manifests_and_keeps_valid_ones() {
		let apps = tempfile::tempdir().unwrap();
		let users = tempfile::tempdir().unwrap();
		write_sample_app(&apps.path().join("a.b"), "a.b");
		std::fs::create_dir_all(apps.path().join("broken")).unwrap();
		std::fs::write(apps.path().join("broken/manifest.json"), b"not json").unwrap();

		let store = PackageStore::new(apps.path().to_path_buf(), users.path().to_path_buf());
		store.initialize().unwrap();

		let ids: Vec<String> = store.list().into_iter().map(|e| e.manifest.id).collect();
		assert_eq!(ids, vec!["a.b".to_string()]);
	}

	#[test]
	fn s3_prebuilt_wins_over_user_install_with_same_id() {
		let apps = tempfile::tempdir().unwrap();
		let users = tempfile::tempdir().unwrap();
		write_sample_app(&apps.path().join("a.b"), "a.b");
		write_sample_app(&users.path().join("a.b"), "a.b");

		let store = PackageStore::new(apps.path().to_path_buf(), users.path().to_path_buf());
		store.initialize().unwrap();

		let entry = store.get("a.b").unwrap();
		assert!(entry.manifest.is_prebuilt);
		assert_eq!(entry.install_path, apps.path().join("a.b"));
	}

	#[tokio::test]
	async fn s1_install_then_uninstall_round_trip() {
		let apps = tempfile::tempdir().unwrap();
		let users = tempfile::tempdir().unwrap();
		let store = PackageStore::new(apps.path().to_path_buf(), users.path().to_path_buf());
		store.initialize().unwrap();

		let source = tempfile::tempdir().unwrap();
		write_sample_app(source.path(), "x.y");
		let archive_bytes = archive::build(source.path(), 3).unwrap();

		let entry = store.install(archive_bytes).await.unwrap();
		assert_eq!(entry.manifest.id, "x.y");
		assert!(store.get("x.y").is_some());

		store.uninstall("x.y").await.unwrap();
		assert!(store.get("x.y").is_none());
		assert!(!entry.install_path.exists());
	}

	#[tokio::test]
	async fn installing_a_duplicate_id_is_rejected() {
		let apps = tempfile::tempdir().unwrap();
		let users = tempfile::tempdir().unwrap();
		let store = PackageStore::new(apps.path().to_path_buf(), users.path().to_path_buf());
		store.initialize().unwrap();

		let source = tempfile::tempdir().unwrap();
		write_sample_app(source.path(), "x.y");
		let archive_bytes = archive::build(source.path(), 3).unwrap();

		store.install(archive_bytes.clone()).await.unwrap();
		let err = store.install(archive_bytes).await.unwrap_err();
		assert_eq!(err.kind(), "AlreadyExists");
	}

	#[tokio::test]
	async fn uninstalling_a_prebuilt_app_is_rejected() {
		let apps = tempfile::tempdir().unwrap();
		let users = tempfile::tempdir().unwrap();
		write_sample_app(&apps.path().join("a.b"), "a.b");
		let store = PackageStore::new(apps.path().to_path_buf(), users.path().to_path_buf());
		store.initialize().unwrap();

		let err = store.uninstall("a.b").await.unwrap_err();
		assert_eq!(err.kind(), "SystemApp");
	}
}
