use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{BlobSink, ByteStream, Error, Locator, validate_key};

/// In-memory blob sink.
///
/// Suitable for tests and single-process runs. Can be switched offline to
/// simulate an unreachable backend.
#[derive(Debug, Default)]
pub struct InMemoryBlobSink {
  blobs: RwLock<HashMap<String, (String, Bytes)>>,
  offline: AtomicBool,
}

impl InMemoryBlobSink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent call fail with [`Error::Unavailable`].
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Keys currently stored, sorted.
  pub fn keys(&self) -> Vec<String> {
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    let mut keys: Vec<String> = blobs.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Fetch a stored blob and its content type without streaming.
  pub fn snapshot(&self, key: &str) -> Option<(String, Bytes)> {
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    blobs.get(key).cloned()
  }

  fn check_online(&self) -> Result<(), Error> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(Error::Unavailable("in-memory sink is offline".to_string()));
    }
    Ok(())
  }
}

#[async_trait]
impl BlobSink for InMemoryBlobSink {
  async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<Locator, Error> {
    self.check_online()?;
    validate_key(key)?;

    let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
    blobs.insert(key.to_string(), (content_type.to_string(), data));
    Ok(Locator::new(format!("memory://{}", key)))
  }

  async fn get(&self, key: &str) -> Result<ByteStream, Error> {
    self.check_online()?;
    let data = self
      .snapshot(key)
      .map(|(_, data)| data)
      .ok_or_else(|| Error::NotFound(key.to_string()))?;
    Ok(Box::pin(futures::stream::once(async move { Ok::<_, Error>(data) })))
  }
}
