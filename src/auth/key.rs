use zeroize::Zeroize;

use crate::error::{CoreError, Result};

/// A validated symmetric key, held as exactly 32 bytes for AES-256-GCM.
/// Zeroized on drop so a key doesn't linger in freed memory.
pub struct SymmetricKey(Vec<u8>);

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl SymmetricKey {
    /// Accepts either a 64-character hex string (decoded to 32 bytes) or a
    /// raw string of at least 32 bytes (truncated to 32). Anything shorter
    /// is rejected with a fatal, startup-aborting error (§4.11, §7).
    pub fn accept(raw: &str) -> Result<Self> {
        let bytes = if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            decode_hex(raw)?
        } else {
            raw.as_bytes().to_vec()
        };

        if bytes.len() < 32 {
            return Err(CoreError::Fatal(format!(
                "auth key must be at least 32 bytes of entropy, got {}",
                bytes.len()
            )));
        }

        Ok(Self(bytes[..32].to_vec()))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16);
        let lo = (pair[1] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
            _ => return Err(CoreError::Fatal("auth key is not valid hex".to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_raw_32_byte_key() {
        let raw = "x".repeat(32);
        assert!(SymmetricKey::accept(&raw).is_ok());
    }

    #[test]
    fn accepts_64_char_hex_key() {
        let hex = "a".repeat(64);
        let key = SymmetricKey::accept(&hex).unwrap();
        assert_eq!(key.as_bytes().len(), 32);
    }

    #[test]
    fn rejects_short_key() {
        let err = SymmetricKey::accept("too-short").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }
}
