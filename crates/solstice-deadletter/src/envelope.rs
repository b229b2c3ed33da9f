//! The persisted form of a dead-lettered message.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifiers recovered from a raw payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunIdentifiers {
  pub project_id: Option<String>,
  pub run_id: Option<String>,
}

impl RunIdentifiers {
  /// Both identifiers, if both were found.
  pub fn complete(&self) -> Option<(&str, &str)> {
    match (&self.project_id, &self.run_id) {
      (Some(project_id), Some(run_id)) => Some((project_id.as_str(), run_id.as_str())),
      _ => None,
    }
  }
}

/// Best-effort extraction of `projectId`/`runId` from a message body.
///
/// Accepts camelCase and snake_case keys at the top level or under a
/// `payload`/`data` object, and string or integer values. Fails only when the
/// body is not a JSON object.
pub fn extract_identifiers(raw_payload: &[u8]) -> Result<RunIdentifiers, serde_json::Error> {
  let value: serde_json::Value = serde_json::from_slice(raw_payload)?;
  if !value.is_object() {
    return Err(serde::de::Error::custom("payload is not a JSON object"));
  }

  let candidates = [Some(&value), value.get("payload"), value.get("data")];

  let mut identifiers = RunIdentifiers::default();
  for object in candidates.into_iter().flatten() {
    if identifiers.project_id.is_none() {
      identifiers.project_id = lookup(object, &["projectId", "project_id"]);
    }
    if identifiers.run_id.is_none() {
      identifiers.run_id = lookup(object, &["runId", "run_id"]);
    }
  }

  Ok(identifiers)
}

fn lookup(object: &serde_json::Value, keys: &[&str]) -> Option<String> {
  keys.iter().find_map(|key| match object.get(*key)? {
    serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
    serde_json::Value::Number(n) => Some(n.to_string()),
    _ => None,
  })
}

/// How `raw_payload` encodes the message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
  /// The body was valid UTF-8 and is stored as is.
  #[default]
  Utf8,
  /// The body was not valid UTF-8 and is stored as standard base64.
  Base64,
}

/// Everything known about a poison message, as written to the blob sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
  pub message_id: String,
  pub source_queue: String,
  pub failure_type: String,
  pub timestamp: DateTime<Utc>,
  pub run_id: Option<String>,
  pub project_id: Option<String>,
  /// The message body, encoded per `payload_encoding`.
  pub raw_payload: String,
  #[serde(default)]
  pub payload_encoding: PayloadEncoding,
}

/// Encode a message body without losing bytes.
pub fn encode_payload(raw_payload: &[u8]) -> (PayloadEncoding, String) {
  match std::str::from_utf8(raw_payload) {
    Ok(text) => (PayloadEncoding::Utf8, text.to_string()),
    Err(_) => (
      PayloadEncoding::Base64,
      general_purpose::STANDARD.encode(raw_payload),
    ),
  }
}

impl DeadLetterEnvelope {
  /// The original message body.
  pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
    match self.payload_encoding {
      PayloadEncoding::Utf8 => Ok(self.raw_payload.as_bytes().to_vec()),
      PayloadEncoding::Base64 => general_purpose::STANDARD.decode(&self.raw_payload),
    }
  }

  /// Blob key: `dead-letters/{failure_type}/{run_id}/{timestamp}-{message_id}.json`.
  pub fn blob_key(&self) -> String {
    format!(
      "dead-letters/{}/{}/{}-{}.json",
      key_segment(&self.failure_type),
      key_segment(self.run_id.as_deref().unwrap_or("unknown")),
      self.timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
      key_segment(&self.message_id),
    )
  }
}

/// Make an arbitrary string safe to use as one blob key segment.
fn key_segment(value: &str) -> String {
  let cleaned: String = value
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
        c
      } else {
        '_'
      }
    })
    .collect();

  if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
    "_".to_string()
  } else {
    cleaned
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_extract_camel_case() {
    let ids = extract_identifiers(br#"{"projectId": "P1", "runId": "R1"}"#).unwrap();
    assert_eq!(ids.complete(), Some(("P1", "R1")));
  }

  #[test]
  fn test_extract_snake_case_and_numbers() {
    let ids = extract_identifiers(br#"{"project_id": 42, "run_id": "R9"}"#).unwrap();
    assert_eq!(ids.complete(), Some(("42", "R9")));
  }

  #[test]
  fn test_extract_nested() {
    let ids = extract_identifiers(br#"{"payload": {"projectId": "P1", "runId": "R1"}}"#).unwrap();
    assert_eq!(ids.complete(), Some(("P1", "R1")));
  }

  #[test]
  fn test_extract_partial() {
    let ids = extract_identifiers(br#"{"runId": "R1"}"#).unwrap();
    assert_eq!(ids.run_id.as_deref(), Some("R1"));
    assert_eq!(ids.complete(), None);
  }

  #[test]
  fn test_extract_rejects_non_json() {
    assert!(extract_identifiers(b"\x00\x01not json").is_err());
    assert!(extract_identifiers(b"[1, 2]").is_err());
  }

  #[test]
  fn test_encode_payload_keeps_bytes() {
    let (encoding, text) = encode_payload(br#"{"runId": "R1"}"#);
    assert_eq!(encoding, PayloadEncoding::Utf8);
    assert_eq!(text, r#"{"runId": "R1"}"#);

    let binary = b"\xff\xfe\x00binary";
    let (encoding, text) = encode_payload(binary);
    assert_eq!(encoding, PayloadEncoding::Base64);

    let envelope = DeadLetterEnvelope {
      message_id: "m1".to_string(),
      source_queue: "q".to_string(),
      failure_type: "design".to_string(),
      timestamp: Utc::now(),
      run_id: None,
      project_id: None,
      raw_payload: text,
      payload_encoding: encoding,
    };
    let decoded: DeadLetterEnvelope =
      serde_json::from_slice(&serde_json::to_vec(&envelope).unwrap()).unwrap();
    assert_eq!(decoded.payload_bytes().unwrap(), binary.to_vec());
  }

  #[test]
  fn test_encoding_defaults_to_utf8() {
    let envelope: DeadLetterEnvelope = serde_json::from_str(
      r#"{"messageId": "m1", "sourceQueue": "q", "failureType": "f",
          "timestamp": "2026-01-01T00:00:00Z", "runId": null, "projectId": null,
          "rawPayload": "abc"}"#,
    )
    .unwrap();
    assert_eq!(envelope.payload_encoding, PayloadEncoding::Utf8);
    assert_eq!(envelope.payload_bytes().unwrap(), b"abc".to_vec());
  }

  #[test]
  fn test_blob_key() {
    let envelope = DeadLetterEnvelope {
      message_id: "m/1".to_string(),
      source_queue: "design-queue".to_string(),
      failure_type: "design".to_string(),
      timestamp: Utc.with_ymd_and_hms(2026, 10, 18, 12, 30, 5).unwrap(),
      run_id: Some("../R1".to_string()),
      project_id: Some("P1".to_string()),
      raw_payload: "{}".to_string(),
      payload_encoding: PayloadEncoding::Utf8,
    };

    assert_eq!(
      envelope.blob_key(),
      "dead-letters/design/.._R1/20261018T123005.000Z-m_1.json"
    );
  }

  #[test]
  fn test_blob_key_unknown_run() {
    let envelope = DeadLetterEnvelope {
      message_id: "m1".to_string(),
      source_queue: "q".to_string(),
      failure_type: "..".to_string(),
      timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
      run_id: None,
      project_id: None,
      raw_payload: String::new(),
      payload_encoding: PayloadEncoding::Utf8,
    };

    assert!(envelope.blob_key().starts_with("dead-letters/_/unknown/"));
  }
}
