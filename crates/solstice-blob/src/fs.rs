use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::{BlobSink, ByteStream, Error, Locator, validate_key};

/// Filesystem-based blob sink.
///
/// Stores blobs as files on the local filesystem. Each blob is stored at
/// `{base_path}/{key}` and its locator is a `file://` URL. Parent directories
/// are created automatically.
pub struct FsBlobSink {
  base_path: PathBuf,
}

impl FsBlobSink {
  /// Create a new filesystem sink with the given base path.
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn key_to_path(&self, key: &str) -> Result<PathBuf, Error> {
    validate_key(key)?;
    Ok(self.base_path.join(key))
  }
}

/// `{path}.partial`, keeping the blob's own extension in the name.
fn partial_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_os_string();
  name.push(".partial");
  PathBuf::from(name)
}

#[async_trait]
impl BlobSink for FsBlobSink {
  async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<Locator, Error> {
    let path = self.key_to_path(key)?;

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    // Write to a sibling temp file first so a crash never leaves a torn blob.
    let tmp_path = partial_path(&path);
    let mut file = File::create(&tmp_path).await?;
    file.write_all(&data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, &path).await?;

    Ok(Locator::new(format!("file://{}", path.display())))
  }

  async fn get(&self, key: &str) -> Result<ByteStream, Error> {
    let path = self.key_to_path(key)?;
    let file = File::open(&path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(key.to_string())
      } else {
        Error::Io(e)
      }
    })?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }
}
