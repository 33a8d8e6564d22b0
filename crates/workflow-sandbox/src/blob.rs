//! Namespace blob codec (`spec.md` §4.6): gzip the UTF-8 JSON encoding of a
//! sandbox namespace. Base64 is a wire-facing concern for
//! `workflow-virtual-server`, not this codec — callers holding these bytes
//! in-process never need the text encoding at all.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::memory::Namespace;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("failed to serialize namespace: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("gzip codec error: {0}")]
    Gzip(#[source] std::io::Error),
}

/// Gzips the JSON encoding of `namespace`. The result is an opaque byte
/// blob; callers exposing it over HTTP base64-encode it themselves.
pub fn export_namespace(namespace: &Namespace) -> Result<Vec<u8>, BlobError> {
    let json = serde_json::to_vec(namespace)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(BlobError::Gzip)?;
    encoder.finish().map_err(BlobError::Gzip)
}

/// Reverses [`export_namespace`]. Rejects truncated or non-gzip input via
/// the underlying decoder rather than guessing at recovery.
pub fn import_namespace(blob: &[u8]) -> Result<Namespace, BlobError> {
    let mut decoder = GzDecoder::new(blob);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).map_err(BlobError::Gzip)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use workflow_core::storage::Storage;

    #[tokio::test]
    async fn export_then_import_round_trips() {
        let storage = MemoryStorage::new();
        storage.create_user(serde_json::json!({"k": "v"})).await.unwrap();
        let namespace = storage.snapshot().await;

        let blob = export_namespace(&namespace).unwrap();
        let restored = import_namespace(&blob).unwrap();

        assert_eq!(restored.users.len(), namespace.users.len());
    }

    #[test]
    fn rejects_garbage_input() {
        let err = import_namespace(b"not gzip data");
        assert!(err.is_err());
    }
}
