//! Frame security codec: compression and authenticated encryption
//!
//! Wire layout when encryption is enabled:
//!
//! ```text
//! IV[16] ‖ AES-256-CBC/PKCS7 ciphertext ‖ HMAC-SHA256 tag[32]
//! ```
//!
//! The plaintext block is a 1-byte flags field (bit 0 = compressed) followed
//! by the, possibly gzip-compressed, frame. Working keys are derived from
//! one master secret: `SHA256(master ‖ "enc")` for the cipher and
//! `SHA256(master ‖ "mac")` for the tag. The tag covers `IV ‖ ciphertext`
//! and is verified, in constant time, before any decryption is attempted.
//!
//! With neither feature enabled the codec is a transparent passthrough and
//! [`SecureTransport`] adds zero bytes of overhead.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use cw_core::config::SecurityConfig;
use cw_core::error::{SecurityError, TransportError};
use cw_core::FrameTransport;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const FLAG_COMPRESSED: u8 = 0x01;
const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 32;

struct DerivedKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

/// Stateless per-frame codec applying compression and encryption
pub struct SecurityCodec {
    /// Compression threshold in bytes, when compression is enabled
    compression: Option<usize>,
    keys: Option<DerivedKeys>,
}

impl SecurityCodec {
    /// Build a codec from configuration, deriving the working keys
    pub fn from_config(config: &SecurityConfig) -> Result<Self, SecurityError> {
        let compression = config
            .enable_compression
            .then_some(config.compression_threshold_bytes);

        let keys = if config.enable_encryption {
            let master = config.resolve_key()?.ok_or(SecurityError::MissingKey)?;
            Some(DerivedKeys {
                enc: derive_key(&master, b"enc"),
                mac: derive_key(&master, b"mac"),
            })
        } else {
            None
        };

        Ok(Self { compression, keys })
    }

    /// Whether the codec passes frames through unchanged
    pub fn is_transparent(&self) -> bool {
        self.compression.is_none() && self.keys.is_none()
    }

    /// Encode one outbound frame
    pub fn encode(&self, frame: &[u8]) -> Result<Bytes, SecurityError> {
        if self.is_transparent() {
            return Ok(Bytes::copy_from_slice(frame));
        }

        let mut flags = 0u8;
        let mut payload = Cow::Borrowed(frame);

        if let Some(threshold) = self.compression {
            if frame.len() >= threshold {
                let compressed = gzip_compress(frame)?;
                // Never let compression inflate a frame; keep the original
                // bytes when gzip does not win.
                if compressed.len() < frame.len() {
                    payload = Cow::Owned(compressed);
                    flags |= FLAG_COMPRESSED;
                }
            }
        }

        let mut block = Vec::with_capacity(1 + payload.len());
        block.push(flags);
        block.extend_from_slice(&payload);

        match &self.keys {
            Some(keys) => Ok(Bytes::from(encrypt(keys, &block)?)),
            None => Ok(Bytes::from(block)),
        }
    }

    /// Decode one inbound frame
    pub fn decode(&self, frame: &[u8]) -> Result<Bytes, SecurityError> {
        if self.is_transparent() {
            return Ok(Bytes::copy_from_slice(frame));
        }

        let block = match &self.keys {
            Some(keys) => decrypt(keys, frame)?,
            None => frame.to_vec(),
        };

        let Some((&flags, body)) = block.split_first() else {
            return Err(SecurityError::MissingHeader);
        };

        if flags & FLAG_COMPRESSED != 0 {
            Ok(Bytes::from(gzip_decompress(body)?))
        } else {
            Ok(Bytes::copy_from_slice(body))
        }
    }
}

fn derive_key(master: &[u8], purpose: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(purpose);
    hasher.finalize().into()
}

fn encrypt(keys: &DerivedKeys, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&keys.enc.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let tag = compute_tag(&keys.mac, &iv, &ciphertext)?;

    let mut output = Vec::with_capacity(IV_SIZE + ciphertext.len() + TAG_SIZE);
    output.extend_from_slice(&iv);
    output.extend_from_slice(&ciphertext);
    output.extend_from_slice(&tag);
    Ok(output)
}

fn decrypt(keys: &DerivedKeys, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    if data.len() < IV_SIZE + TAG_SIZE {
        return Err(SecurityError::TruncatedFrame { size: data.len() });
    }

    let (iv, rest) = data.split_at(IV_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

    // Authenticate before touching the ciphertext; verify_slice compares in
    // constant time.
    let mut mac = HmacSha256::new_from_slice(&keys.mac)
        .map_err(|e| SecurityError::Cipher(e.to_string()))?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| SecurityError::AuthenticationFailed)?;

    Aes256CbcDec::new_from_slices(&keys.enc, iv)
        .map_err(|e| SecurityError::Cipher(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| SecurityError::Cipher(e.to_string()))
}

fn compute_tag(
    mac_key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<[u8; 32], SecurityError> {
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| SecurityError::Cipher(e.to_string()))?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().into())
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| SecurityError::Compress(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SecurityError::Compress(e.to_string()))
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| SecurityError::Decompress(e.to_string()))?;
    Ok(output)
}

/// Wraps any [`FrameTransport`], applying the security codec to every frame
///
/// Conforms to the identical send/receive contract as the transport it
/// wraps, so sessions compose it without special-casing. The empty
/// closure-signal frame passes through untouched.
pub struct SecureTransport {
    inner: Arc<dyn FrameTransport>,
    codec: SecurityCodec,
}

impl SecureTransport {
    /// Wrap a transport with an already-built codec
    pub fn new(inner: Arc<dyn FrameTransport>, codec: SecurityCodec) -> Self {
        Self { inner, codec }
    }

    /// Wrap a transport, building the codec from configuration
    pub fn from_config(
        inner: Arc<dyn FrameTransport>,
        config: &SecurityConfig,
    ) -> Result<Self, SecurityError> {
        Ok(Self::new(inner, SecurityCodec::from_config(config)?))
    }
}

#[async_trait]
impl FrameTransport for SecureTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let encoded = self.codec.encode(&frame)?;
        self.inner.send_frame(encoded).await
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        let raw = self.inner.recv_frame().await?;
        if raw.is_empty() {
            return Ok(raw);
        }
        Ok(self.codec.decode(&raw)?)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_hex() -> String {
        (0u8..32).map(|i| format!("{i:02x}")).collect()
    }

    fn codec(compression: bool, threshold: usize, encryption: bool) -> SecurityCodec {
        let config = SecurityConfig {
            enable_compression: compression,
            compression_threshold_bytes: threshold,
            enable_encryption: encryption,
            encryption_key_hex: encryption.then(key_hex),
        };
        SecurityCodec::from_config(&config).unwrap()
    }

    #[test]
    fn test_roundtrip_all_feature_combinations() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x42],
            vec![0x5A; 4096],
            (0..2048u32).flat_map(|v| v.to_le_bytes()).collect(),
        ];

        for compression in [false, true] {
            for encryption in [false, true] {
                let codec = codec(compression, 0, encryption);
                for payload in &payloads {
                    let encoded = codec.encode(payload).unwrap();
                    let decoded = codec.decode(&encoded).unwrap();
                    assert_eq!(
                        decoded.as_ref(),
                        payload.as_slice(),
                        "compression={compression} encryption={encryption} len={}",
                        payload.len()
                    );
                }
            }
        }
    }

    #[test]
    fn test_transparent_codec_is_identity() {
        let codec = codec(false, 0, false);
        assert!(codec.is_transparent());

        let payload = b"untouched bytes";
        let encoded = codec.encode(payload).unwrap();
        assert_eq!(encoded.as_ref(), payload);
        assert_eq!(codec.decode(&encoded).unwrap().as_ref(), payload);
    }

    #[test]
    fn test_compression_threshold_boundary() {
        let threshold = 256;
        let codec = codec(true, threshold, false);

        // One byte under the threshold is passed through with flags clear
        let under: Vec<u8> = vec![0x00; threshold - 1];
        let encoded = codec.encode(&under).unwrap();
        assert_eq!(encoded[0] & FLAG_COMPRESSED, 0);
        assert_eq!(encoded.len(), under.len() + 1);

        // At the threshold the (highly compressible) frame shrinks
        let at: Vec<u8> = vec![0x00; threshold];
        let encoded = codec.encode(&at).unwrap();
        assert_eq!(encoded[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(encoded.len() < at.len());

        for payload in [under, at, vec![0x00; threshold + 1]] {
            let encoded = codec.encode(&payload).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap().as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_incompressible_frame_keeps_original_bytes() {
        // A pseudo-random frame grows under gzip; the codec must keep the
        // original bytes and leave the compressed flag clear.
        let mut state = 0x12345678u32;
        let payload: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();

        let codec = codec(true, 0, false);
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(encoded[0] & FLAG_COMPRESSED, 0);
        assert_eq!(&encoded[1..], payload.as_slice());
    }

    #[test]
    fn test_encrypted_layout() {
        let codec = codec(false, 0, true);
        let payload = b"layout check";

        let encoded = codec.encode(payload).unwrap();
        // IV + at least one cipher block + tag; CBC pads to 16-byte blocks
        assert!(encoded.len() >= IV_SIZE + 16 + TAG_SIZE);
        assert_eq!((encoded.len() - IV_SIZE - TAG_SIZE) % 16, 0);
    }

    #[test]
    fn test_fresh_iv_per_frame() {
        let codec = codec(false, 0, true);
        let a = codec.encode(b"same plaintext").unwrap();
        let b = codec.encode(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_any_single_bit_flip_fails_authentication() {
        let codec = codec(false, 0, true);
        let encoded = codec.encode(b"authenticated frame").unwrap();

        for byte_index in 0..encoded.len() {
            for bit in 0..8 {
                let mut tampered = encoded.to_vec();
                tampered[byte_index] ^= 1 << bit;

                let result = codec.decode(&tampered);
                assert!(
                    matches!(result, Err(SecurityError::AuthenticationFailed)),
                    "flip at byte {byte_index} bit {bit} was not caught"
                );
            }
        }
    }

    #[test]
    fn test_truncated_encrypted_frame_rejected() {
        let codec = codec(false, 0, true);
        let result = codec.decode(&[0u8; IV_SIZE + TAG_SIZE - 1]);
        assert!(matches!(result, Err(SecurityError::TruncatedFrame { .. })));
    }

    #[test]
    fn test_missing_key_rejected() {
        let config = SecurityConfig {
            enable_encryption: true,
            ..Default::default()
        };
        assert!(matches!(
            SecurityCodec::from_config(&config),
            Err(SecurityError::MissingKey)
        ));
    }

    #[test]
    fn test_compression_and_encryption_compose() {
        let codec = codec(true, 0, true);
        let payload = vec![0xABu8; 8192];

        let encoded = codec.encode(&payload).unwrap();
        // Compressed then encrypted: much smaller than the plaintext
        assert!(encoded.len() < payload.len() / 2);
        assert_eq!(codec.decode(&encoded).unwrap().as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_secure_transport_passes_closure_signal() {
        use crate::loopback::LoopbackTransport;

        let (a, b) = LoopbackTransport::pair();
        let config = SecurityConfig {
            enable_encryption: true,
            encryption_key_hex: Some(key_hex()),
            ..Default::default()
        };

        let secure_a = SecureTransport::from_config(Arc::new(a), &config).unwrap();
        let secure_b = SecureTransport::from_config(Arc::new(b), &config).unwrap();
        secure_a.connect().await.unwrap();
        secure_b.connect().await.unwrap();

        secure_a
            .send_frame(Bytes::from_static(b"wrapped"))
            .await
            .unwrap();
        assert_eq!(secure_b.recv_frame().await.unwrap().as_ref(), b"wrapped");

        secure_a.close().await.unwrap();
        assert!(secure_b.recv_frame().await.unwrap().is_empty());
    }
}
