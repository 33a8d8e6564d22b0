//! Wire encoding for the virtual sandbox blob (`spec.md` §4.6): base64 over
//! `workflow_sandbox::blob`'s gzip+JSON bytes, so `virtual_db` round-trips
//! as a plain string in a JSON request/response body.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use workflow_sandbox::{export_namespace, import_namespace, BlobError, MemoryStorage};

#[derive(Debug, thiserror::Error)]
pub enum VirtualDbError {
    #[error("invalid virtual_db encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

pub async fn decode(virtual_db: &str) -> Result<MemoryStorage, VirtualDbError> {
    let bytes = BASE64.decode(virtual_db)?;
    let namespace = import_namespace(&bytes)?;
    Ok(MemoryStorage::from_namespace(namespace))
}

pub async fn encode(storage: &MemoryStorage) -> Result<String, VirtualDbError> {
    let namespace = storage.snapshot().await;
    let bytes = export_namespace(&namespace)?;
    Ok(BASE64.encode(bytes))
}
