//! Persistence and policy contracts.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;

use crate::error::{Error, Result};
use crate::key::SharedPrivate;
use crate::wire::{LongtermProposal, SignatureInfo};

/// Persistence of the long-term distributed share. Implementations are
/// free to encrypt at rest; callers serialize access through a single
/// background task.
pub trait Store: Send + Sync {
    fn save_longterm(&self, share: &SharedPrivate) -> Result<()>;
    fn load_longterm(&self) -> Result<Option<SharedPrivate>>;
}

/// Policy hook deciding whether to take part in a key creation or a
/// signature. The reason string is surfaced verbatim, never interpreted.
pub trait Validator: Send + Sync {
    fn validate_longterm_info(&self, proposal: &LongtermProposal) -> (bool, String);
    fn validate_signature_info(&self, info: &SignatureInfo) -> (bool, String);
}

/// JSON file store with atomic write-then-rename persistence.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        FileStore { path }
    }
}

impl Store for FileStore {
    fn save_longterm(&self, share: &SharedPrivate) -> Result<()> {
        let json = serde_json::to_string_pretty(share)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| Error::Storage(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::Storage(e.to_string()))?;
        info!(path = %self.path.display(), key_id = %share.key_id, "longterm share saved");
        Ok(())
    }

    fn load_longterm(&self) -> Result<Option<SharedPrivate>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(e.to_string())),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }
}

/// Volatile store for tests.
#[derive(Default)]
pub struct MemStore {
    slot: Mutex<Option<SharedPrivate>>,
}

impl Store for MemStore {
    fn save_longterm(&self, share: &SharedPrivate) -> Result<()> {
        *self.slot.lock().unwrap() = Some(share.clone());
        Ok(())
    }

    fn load_longterm(&self) -> Result<Option<SharedPrivate>> {
        Ok(self.slot.lock().unwrap().clone())
    }
}

/// Validator that accepts every proposal and signature request.
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate_longterm_info(&self, _proposal: &LongtermProposal) -> (bool, String) {
        (true, String::new())
    }

    fn validate_signature_info(&self, _info: &SignatureInfo) -> (bool, String) {
        (true, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::poly::SecretPolynomial;
    use crate::key::Share;
    use rand::{rngs::OsRng, RngCore};

    fn sample() -> SharedPrivate {
        let poly = SecretPolynomial::random(2, &mut OsRng);
        let share = Share {
            index: 0,
            private: poly.evaluate(0),
            commits: poly.commitment().into_points(),
        };
        SharedPrivate {
            key_id: SharedPrivate::key_id_for(share.public()),
            full_name: "Test Group".into(),
            email: "test@example.org".into(),
            extra: String::new(),
            share,
        }
    }

    #[test]
    fn file_store_roundtrip() {
        let path = std::env::temp_dir().join(format!("edsign-store-{}.json", OsRng.next_u64()));
        let store = FileStore::new(path.clone());
        assert!(store.load_longterm().unwrap().is_none());

        let saved = sample();
        store.save_longterm(&saved).unwrap();
        let loaded = store.load_longterm().unwrap().unwrap();
        assert_eq!(loaded.key_id, saved.key_id);
        assert_eq!(loaded.share.private, saved.share.private);

        std::fs::remove_file(path).unwrap();
    }
}
