//! Storage of uploaded assets and rendered results.
//!
//! Handlers only see the [`Storage`] trait and address assets by [`AssetId`], a plain file
//! name without any path components. [`DiskStorage`] keeps all assets in a single directory.
use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a preserved file extension.
const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid asset name {0:?}")]
    InvalidId(String),
    #[error("asset {0} not found")]
    NotFound(AssetId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Name of a stored asset.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AssetId(String);

impl AssetId {
    /// Generate a collision-resistant name, keeping the extension of `file_name` if it has a
    /// usable one.
    pub fn generate(file_name: Option<&str>) -> Self {
        let stem = Uuid::new_v4().simple().to_string();
        match file_name.and_then(sanitized_extension) {
            Some(ext) => Self(format!("{stem}.{ext}")),
            None => Self(stem),
        }
    }

    /// Validate a name received from a client.
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name.len() <= 255
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        match valid {
            true => Ok(Self(name.to_owned())),
            false => Err(StorageError::InvalidId(name.to_owned())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-case extension, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.0)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitized_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?;
    let valid = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

/// Blob storage for assets.
pub trait Storage: Send + Sync {
    /// Store `bytes` under a freshly generated name derived from `file_name`.
    fn put(&self, bytes: &[u8], file_name: Option<&str>) -> Result<AssetId, StorageError>;

    /// Store `bytes` under a fixed name, replacing a previous asset of that name.
    fn put_named(&self, id: &AssetId, bytes: &[u8]) -> Result<(), StorageError>;

    fn get(&self, id: &AssetId) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, id: &AssetId) -> Result<(), StorageError>;

    fn list(&self) -> Result<Vec<AssetId>, StorageError>;

    /// Path on the local file system, for consumers that can only open files.
    fn local_path(&self, _id: &AssetId) -> Option<PathBuf> {
        None
    }
}

/// Storage in a directory on the local disk.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Use `root` as storage directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::info!("Storing assets in {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, id: &AssetId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl Storage for DiskStorage {
    fn put(&self, bytes: &[u8], file_name: Option<&str>) -> Result<AssetId, StorageError> {
        let id = AssetId::generate(file_name);
        // `create_new` guards against the unlikely case of a name collision
        let mut file = File::options()
            .write(true)
            .create_new(true)
            .open(self.path(&id))?;
        file.write_all(bytes)?;
        log::debug!("Stored {} ({} bytes)", &id, bytes.len());
        Ok(id)
    }

    fn put_named(&self, id: &AssetId, bytes: &[u8]) -> Result<(), StorageError> {
        // Write to a temporary name first so readers never see a partial file
        let tmp = self.root.join(format!(".{}.tmp", AssetId::generate(None)));
        fs::write(&tmp, bytes)?;
        if let Err(err) = fs::rename(&tmp, self.path(id)) {
            fs::remove_file(&tmp).ok();
            return Err(err.into());
        }
        log::debug!("Stored {} ({} bytes)", id, bytes.len());
        Ok(())
    }

    fn get(&self, id: &AssetId) -> Result<Vec<u8>, StorageError> {
        fs::read(self.path(id)).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(id.clone()),
            _ => err.into(),
        })
    }

    fn delete(&self, id: &AssetId) -> Result<(), StorageError> {
        fs::remove_file(self.path(id)).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(id.clone()),
            _ => err.into(),
        })?;
        log::debug!("Deleted {}", id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<AssetId>, StorageError> {
        let mut ids = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            // Entries may vanish between listing and inspection
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| AssetId::parse(name).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn local_path(&self, id: &AssetId) -> Option<PathBuf> {
        Some(self.path(id))
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_generated_names_keep_extension() {
        let id = AssetId::generate(Some("Holiday.Video.MP4"));
        assert!(id.as_str().ends_with(".mp4"));
        assert_eq!(id.extension().as_deref(), Some("mp4"));
        assert_eq!(id.as_str().len(), 32 + 4);
    }

    #[test]
    fn test_generated_names_drop_bad_extensions() {
        for name in [None, Some("noext"), Some("a.b/c"), Some("x.ex t"), Some("y.verylongext")] {
            let id = AssetId::generate(name);
            assert_eq!(id.extension(), None, "{name:?}");
        }
    }

    #[test]
    fn test_generated_names_are_unique() {
        let a = AssetId::generate(Some("a.jpg"));
        let b = AssetId::generate(Some("a.jpg"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_rejects_paths() {
        for name in ["", "../etc/passwd", "static/a.jpg", ".hidden", "a b.jpg", "a\\b"] {
            assert!(AssetId::parse(name).is_err(), "{name:?}");
        }
        assert!(AssetId::parse("0f3e_result-image.jpg").is_ok());
    }

    #[test]
    fn test_disk_storage_lifecycle() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = DiskStorage::new(dir.path())?;

        let id = storage.put(b"hello", Some("greeting.txt"))?;
        assert_eq!(storage.get(&id)?, b"hello");
        assert_eq!(storage.list()?, vec![id.clone()]);
        assert_eq!(storage.local_path(&id), Some(dir.path().join(id.as_str())));

        storage.delete(&id)?;
        assert!(matches!(storage.get(&id), Err(StorageError::NotFound(_))));
        assert!(matches!(storage.delete(&id), Err(StorageError::NotFound(_))));
        assert!(storage.list()?.is_empty());

        Ok(())
    }

    #[test]
    fn test_put_named_overwrites() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = DiskStorage::new(dir.path())?;
        let id = AssetId::parse("result_image.jpg")?;

        storage.put_named(&id, b"first")?;
        storage.put_named(&id, b"second")?;

        assert_eq!(storage.get(&id)?, b"second");
        assert_eq!(storage.list()?, vec![id]);

        Ok(())
    }
}
