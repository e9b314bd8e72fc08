//! Frame security configuration

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// Compression and encryption settings applied to every frame
///
/// With both features off the codec is a transparent passthrough and adds
/// zero bytes of overhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Gzip frames at or above the threshold
    pub enable_compression: bool,
    /// Minimum frame size, in bytes, before compression is attempted
    pub compression_threshold_bytes: usize,
    /// Encrypt and authenticate every frame
    pub enable_encryption: bool,
    /// Hex-encoded master secret; must decode to 16, 24, or 32 bytes.
    /// The working keys are derived from it, never used directly.
    pub encryption_key_hex: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_compression: false,
            compression_threshold_bytes: 1024,
            enable_encryption: false,
            encryption_key_hex: None,
        }
    }
}

impl SecurityConfig {
    /// Whether any security feature is configured
    pub fn is_enabled(&self) -> bool {
        self.enable_compression || self.enable_encryption
    }

    /// Decode and validate the master secret
    pub fn resolve_key(&self) -> Result<Option<Vec<u8>>, SecurityError> {
        let Some(encoded) = self.encryption_key_hex.as_deref() else {
            return Ok(None);
        };

        let key = hex::decode(encoded.trim())
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;

        match key.len() {
            16 | 24 | 32 => Ok(Some(key)),
            n => Err(SecurityError::InvalidKeyLength(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SecurityConfig::default();
        assert!(!config.is_enabled());
        assert_eq!(config.compression_threshold_bytes, 1024);
        assert!(config.resolve_key().unwrap().is_none());
    }

    #[test]
    fn test_resolve_key_valid_lengths() {
        for len in [16usize, 24, 32] {
            let config = SecurityConfig {
                encryption_key_hex: Some("ab".repeat(len)),
                ..Default::default()
            };
            let key = config.resolve_key().unwrap().unwrap();
            assert_eq!(key.len(), len);
        }
    }

    #[test]
    fn test_resolve_key_bad_length() {
        let config = SecurityConfig {
            encryption_key_hex: Some("abcd".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve_key(),
            Err(SecurityError::InvalidKeyLength(2))
        ));
    }

    #[test]
    fn test_resolve_key_bad_hex() {
        let config = SecurityConfig {
            encryption_key_hex: Some("not-hex".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve_key(),
            Err(SecurityError::InvalidKey(_))
        ));
    }
}
