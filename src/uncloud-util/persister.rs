//! Atomic on-disk persistence: write to a temp file in the same
//! directory, fsync, then rename over the target. Readers never observe
//! a half-written file. Mirrors `garage_util::persister::Persister`.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, ErrorKind};

/// Persists a single serializable value under `dir/name.json`.
pub struct Persister<T> {
	path: PathBuf,
	_marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Persister<T> {
	pub fn new(dir: &Path, name: &str) -> Self {
		let mut path = dir.to_path_buf();
		path.push(format!("{}.json", name));
		Self {
			path,
			_marker: PhantomData,
		}
	}

	pub fn load(&self) -> Result<T, Error> {
		let data = std::fs::read(&self.path).map_err(|e| {
			Error::new(
				ErrorKind::Other,
				anyhow::anyhow!("unable to read {}: {}", self.path.display(), e),
			)
		})?;
		serde_json::from_slice(&data).map_err(|e| {
			Error::new(
				ErrorKind::Other,
				anyhow::anyhow!("unable to parse {}: {}", self.path.display(), e),
			)
		})
	}

	pub async fn load_async(&self) -> Result<T, Error>
	where
		T: Send + 'static,
	{
		let path = self.path.clone();
		tokio::task::spawn_blocking(move || {
			let data = std::fs::read(&path)?;
			serde_json::from_slice(&data).map_err(Error::from)
		})
		.await
		.map_err(|e| Error::new(ErrorKind::Other, e))?
	}

	pub fn save(&self, value: &T) -> Result<(), Error> {
		save_atomic(&self.path, value, 0o600)
	}

	pub async fn save_async(&self, value: &T) -> Result<(), Error>
	where
		T: Send + Sync + 'static,
	{
		let path = self.path.clone();
		let data = serde_json::to_vec_pretty(value).map_err(Error::from)?;
		tokio::task::spawn_blocking(move || write_atomic(&path, &data, 0o600))
			.await
			.map_err(|e| Error::new(ErrorKind::StatePersistFailed, e))?
	}
}

fn save_atomic<T: Serialize>(path: &Path, value: &T, mode: u32) -> Result<(), Error> {
	let data = serde_json::to_vec_pretty(value).map_err(Error::from)?;
	write_atomic(path, &data, mode)
}

fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<(), Error> {
	use std::io::Write;

	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	std::fs::create_dir_all(dir)?;

	let tmp_path = dir.join(format!(
		".{}.tmp.{}",
		path.file_name().unwrap_or_default().to_string_lossy(),
		std::process::id()
	));

	{
		let mut f = std::fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&tmp_path)
			.map_err(|e| {
				Error::new(
					ErrorKind::StatePersistFailed,
					anyhow::anyhow!("creating {}: {}", tmp_path.display(), e),
				)
			})?;
		f.write_all(data).map_err(|e| {
			Error::new(
				ErrorKind::StatePersistFailed,
				anyhow::anyhow!("writing {}: {}", tmp_path.display(), e),
			)
		})?;
		f.sync_all().ok();

		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mut perm = f.metadata()?.permissions();
			perm.set_mode(mode);
			std::fs::set_permissions(&tmp_path, perm)?;
		}
		let _ = mode;
	}

	std::fs::rename(&tmp_path, path).map_err(|e| {
		Error::new(
			ErrorKind::StatePersistFailed,
			anyhow::anyhow!("renaming {} -> {}: {}", tmp_path.display(), path.display(), e),
		)
	})?;

	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use serde::Deserialize;

	#[derive(Serialize, Deserialize, PartialEq, Debug)]
	struct Sample {
		a: u32,
		b: String,
	}

	#[test]
	fn save_then_load_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let p: Persister<Sample> = Persister::new(dir.path(), "sample");
		let v = Sample {
			a: 42,
			b: "hi".into(),
		};
		p.save(&v).unwrap();
		let loaded = p.load().unwrap();
		assert_eq!(v, loaded);
	}

	#[test]
	fn load_missing_file_errors() {
		let dir = tempfile::tempdir().unwrap();
		let p: Persister<Sample> = Persister::new(dir.path(), "missing");
		assert!(p.load().is_err());
	}

	#[tokio::test]
	async fn async_save_then_load_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let p: Persister<Sample> = Persister::new(dir.path(), "sample");
		let v = Sample {
			a: 7,
			b: "async".into(),
		};
		p.save_async(&v).await.unwrap();
		let loaded = p.load_async().await.unwrap();
		assert_eq!(v, loaded);
	}
}
