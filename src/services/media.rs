use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

const BLOB_PREFIX: &str = "blob:";

#[derive(Debug)]
pub struct MediaBlob {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Session-local media addressed by `blob:{uuid}` handles.
///
/// Nothing in here outlives the process, which is why handles are never
/// written to the history store.
#[derive(Default)]
pub struct MediaVault {
    blobs: Mutex<HashMap<Uuid, Arc<MediaBlob>>>,
}

impl MediaVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mime_type: String, bytes: Vec<u8>) -> String {
        let id = Uuid::new_v4();
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(MediaBlob { mime_type, bytes }));
        format!("{BLOB_PREFIX}{id}")
    }

    pub fn get(&self, handle: &str) -> Option<Arc<MediaBlob>> {
        let id = parse_handle(handle)?;
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, handle: &str) -> bool {
        let Some(id) = parse_handle(handle) else {
            return false;
        };
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

fn parse_handle(handle: &str) -> Option<Uuid> {
    handle.strip_prefix(BLOB_PREFIX)?.parse().ok()
}

/// Split `data:{mime};base64,{payload}` into its mime type and payload.
pub fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    rest.split_once(";base64,")
}

pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let (mime, payload) = split_data_uri(uri)?;
    let bytes = BASE64.decode(payload).ok()?;
    Some((mime.to_string(), bytes))
}

#[cfg(test)]
pub fn encode_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_hands_out_blob_handles() {
        let vault = MediaVault::new();
        let handle = vault.insert("video/mp4".to_string(), vec![1, 2, 3]);
        assert!(handle.starts_with("blob:"));

        let blob = vault.get(&handle).expect("blob present");
        assert_eq!(blob.mime_type, "video/mp4");
        assert_eq!(blob.bytes, vec![1, 2, 3]);

        assert!(vault.remove(&handle));
        assert!(vault.get(&handle).is_none());
        assert!(!vault.remove(&handle));
    }

    #[test]
    fn vault_ignores_foreign_handles() {
        let vault = MediaVault::new();
        assert!(vault.get("https://example.com/video.mp4").is_none());
        assert!(!vault.remove("blob:not-a-uuid"));
    }

    #[test]
    fn data_uri_round_trip() {
        let uri = encode_data_uri("image/png", b"png-bytes");
        assert_eq!(split_data_uri(&uri).unwrap().0, "image/png");
        let (mime, bytes) = decode_data_uri(&uri).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"png-bytes");
    }

    #[test]
    fn rejects_non_data_uri() {
        assert!(split_data_uri("blob:123").is_none());
        assert!(decode_data_uri("data:image/png,plain").is_none());
    }
}
