//! Pre-shared attach key.
//!
//! The key is provisioned into the guest out of band and handed to the host
//! operator the same way. On disk it is stored as 64 hex characters.

use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Length of the attach key in bytes.
pub const ATTACH_KEY_LENGTH: usize = 32;

/// Number of hash bytes shown in a key fingerprint.
const FINGERPRINT_LENGTH: usize = 8;

/// A 32-byte secret shared by the guest agent and the attaching operator.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachKey([u8; ATTACH_KEY_LENGTH]);

impl AttachKey {
    /// Generates a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ATTACH_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; ATTACH_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; ATTACH_KEY_LENGTH] {
        &self.0
    }

    /// Parses a key from hex, ignoring surrounding whitespace.
    pub fn from_hex(text: &str) -> Result<Self> {
        let decoded = hex::decode(text.trim())
            .map_err(|e| ProtocolError::InvalidKey(format!("not valid hex: {}", e)))?;
        let bytes: [u8; ATTACH_KEY_LENGTH] = decoded.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::InvalidKey(format!(
                "expected {} bytes, got {}",
                ATTACH_KEY_LENGTH,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Encodes the key as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Loads a hex-encoded key file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::InvalidKey(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_hex(&text)
    }

    /// Writes the key as hex, readable only by the owner on unix.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", self.to_hex()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Short non-secret identifier for logs: colon-separated hex of the
    /// first bytes of SHA-256(key).
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.0);
        hash[..FINGERPRINT_LENGTH]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Debug for AttachKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachKey")
            .field("fingerprint", &self.fingerprint())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_produces_unique_keys() {
        assert_ne!(AttachKey::generate(), AttachKey::generate());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = AttachKey::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(AttachKey::from_hex(&format!("  {}\n", hex)).unwrap(), key);
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        let err = AttachKey::from_hex("abcd").unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes, got 2"));
    }

    #[test]
    fn test_from_hex_rejects_non_hex() {
        assert!(matches!(
            AttachKey::from_hex("zz"),
            Err(ProtocolError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("attach.key");
        let key = AttachKey::generate();
        key.save(&path).unwrap();
        assert_eq!(AttachKey::load(&path).unwrap(), key);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_fingerprint_format_and_debug_redaction() {
        let key = AttachKey::from_bytes([7u8; ATTACH_KEY_LENGTH]);
        let fp = key.fingerprint();
        assert_eq!(fp.split(':').count(), 4);
        assert_eq!(fp, key.fingerprint());

        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&key.to_hex()));
    }
}
