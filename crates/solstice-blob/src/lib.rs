//! Solstice Blob
//!
//! This crate provides the blob sink trait and implementations for Solstice.
//! Blobs are opaque byte payloads (raw dead-lettered messages, diagnostic
//! dumps) that are stored separately from workflow run records.
//!
//! The [`BlobSink`] trait is deliberately narrow: store bytes under a key and
//! get back a [`Locator`] that can later be handed to an operator or used to
//! read the bytes back.

mod fs;
mod memory;

pub use fs::FsBlobSink;
pub use memory::InMemoryBlobSink;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// A boxed stream of bytes for blob data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested blob was not found.
  #[error("blob not found: {0}")]
  NotFound(String),

  /// The key is empty, absolute, or escapes the sink root.
  #[error("invalid blob key: {0}")]
  InvalidKey(String),

  /// The sink cannot be reached.
  #[error("blob sink unavailable: {0}")]
  Unavailable(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// A retrievable address for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator(String);

impl Locator {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Locator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Durable byte storage addressed by key.
#[async_trait]
pub trait BlobSink: Send + Sync {
  /// Store a blob and return its locator. Existing blobs under the same key
  /// are overwritten.
  async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<Locator, Error>;

  /// Retrieve a blob by key as a stream of bytes.
  async fn get(&self, key: &str) -> Result<ByteStream, Error>;
}

/// Reject keys that would escape the sink root.
pub(crate) fn validate_key(key: &str) -> Result<(), Error> {
  let escapes = key
    .split('/')
    .any(|segment| segment == ".." || segment == ".");
  if key.is_empty() || key.starts_with('/') || key.contains('\\') || escapes {
    return Err(Error::InvalidKey(key.to_string()));
  }
  Ok(())
}

/// Drain a [`ByteStream`] into a single buffer.
pub async fn read_all(stream: ByteStream) -> Result<Bytes, Error> {
  use futures::StreamExt;

  let mut stream = stream;
  let mut buf = Vec::new();
  while let Some(chunk) = stream.next().await {
    buf.extend_from_slice(&chunk?);
  }
  Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_validate_key() {
    assert!(validate_key("dead-letters/design/run-1/1.json").is_ok());
    assert!(validate_key("").is_err());
    assert!(validate_key("/etc/passwd").is_err());
    assert!(validate_key("a/../../b").is_err());
    assert!(validate_key("a\\b").is_err());
  }

  #[test]
  fn test_locator_display() {
    let locator = Locator::new("memory://a/b");
    assert_eq!(locator.to_string(), "memory://a/b");
    assert_eq!(locator.as_str(), "memory://a/b");
  }
}
