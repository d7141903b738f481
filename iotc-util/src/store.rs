use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use super::fs::safe_write_all;

/// A filesystem backed JSON document store
///
/// Documents live under `{root}/{collection}/{key}.json`. Writes are atomic
/// but there is no locking, two stores on the same root may overwrite each
/// other.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("path must not have any `..` segments")]
    InvalidPath,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn document_path(&self, collection: &Path, key: &str) -> Result<PathBuf, StoreError> {
        let collection = collection.strip_prefix("/").unwrap_or(collection);
        let key = Path::new(key);

        // Only allow plain names, the store must never escape its root
        if collection
            .components()
            .chain(key.components())
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidPath);
        }
        Ok(self.root.join(collection).join(key).with_extension("json"))
    }

    /// Create or update the document `key` in `collection`
    pub async fn write<P: AsRef<Path>, V: Serialize>(
        &self,
        collection: P,
        key: &str,
        value: &V,
    ) -> Result<(), StoreError> {
        let full_path = self.document_path(collection.as_ref(), key)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let buf = serde_json::to_vec(value)?;
        trace!("writing {}", full_path.display());
        safe_write_all(&full_path, &buf).await?;
        Ok(())
    }

    /// Read the document `key` from `collection`, returning `None` if it
    /// does not exist
    pub async fn read<P: AsRef<Path>, V: DeserializeOwned>(
        &self,
        collection: P,
        key: &str,
    ) -> Result<Option<V>, StoreError> {
        let full_path = self.document_path(collection.as_ref(), key)?;
        trace!("reading {}", full_path.display());

        match fs::read_to_string(&full_path).await {
            Ok(contents) => Ok(Some(serde_json::from_str::<V>(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the document `key` from `collection`.
    ///
    /// This operation is idempotent - deleting a non-existent document succeeds.
    pub async fn delete<P: AsRef<Path>>(&self, collection: P, key: &str) -> Result<(), StoreError> {
        let full_path = self.document_path(collection.as_ref(), key)?;
        trace!("removing {}", full_path.display());
        match fs::remove_file(full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
