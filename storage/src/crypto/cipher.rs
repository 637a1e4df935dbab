use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{self, Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use crc32fast::Hasher;

use super::envelope::CryptoEnvelope;
use super::key_source::KeyMaterial;
use super::CryptoError;

const AEAD_NONCE_SIZE: usize = 12;
const AEAD_TAG_SIZE: usize = 16;
const CRC_TAG_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// No confidentiality; a CRC32 of the payload stands in for the tag.
    Plaintext,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn wire_tag(&self) -> u8 {
        match self {
            CipherAlgorithm::Plaintext => 0,
            CipherAlgorithm::Aes128Gcm => 1,
            CipherAlgorithm::Aes256Gcm => 2,
            CipherAlgorithm::ChaCha20Poly1305 => 3,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CipherAlgorithm::Plaintext),
            1 => Some(CipherAlgorithm::Aes128Gcm),
            2 => Some(CipherAlgorithm::Aes256Gcm),
            3 => Some(CipherAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Plaintext => 0,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    pub fn nonce_size(&self) -> usize {
        match self {
            CipherAlgorithm::Plaintext => 0,
            _ => AEAD_NONCE_SIZE,
        }
    }

    pub fn tag_size(&self) -> usize {
        match self {
            CipherAlgorithm::Plaintext => CRC_TAG_SIZE,
            _ => AEAD_TAG_SIZE,
        }
    }

    pub fn requires_key(&self) -> bool {
        self.key_size() > 0
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "plaintext" | "none" | "noop" => Ok(CipherAlgorithm::Plaintext),
            "aes128gcm" => Ok(CipherAlgorithm::Aes128Gcm),
            "aes256gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            "chacha20poly1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            _ => Err(CryptoError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherAlgorithm::Plaintext => "plaintext",
            CipherAlgorithm::Aes128Gcm => "aes-128-gcm",
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        };
        f.write_str(name)
    }
}

enum Inner {
    Plaintext,
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

/// A keyed cipher for one algorithm. Every `encrypt` draws a fresh random
/// nonce from the OS; the algorithm tag byte is authenticated as associated
/// data.
pub struct CipherEngine {
    algorithm: CipherAlgorithm,
    inner: Inner,
}

impl CipherEngine {
    pub fn new(algorithm: CipherAlgorithm, key: &KeyMaterial) -> Result<Self, CryptoError> {
        if algorithm.requires_key() && key.len() != algorithm.key_size() {
            return Err(CryptoError::KeyFormatInvalid(format!(
                "{} requires a {}-byte key, got {} bytes",
                algorithm,
                algorithm.key_size(),
                key.len()
            )));
        }

        let invalid = |_| CryptoError::KeyFormatInvalid(format!("rejected {} key", algorithm));
        let inner = match algorithm {
            CipherAlgorithm::Plaintext => Inner::Plaintext,
            CipherAlgorithm::Aes128Gcm => Inner::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key.as_bytes()).map_err(invalid)?,
            )),
            CipherAlgorithm::Aes256Gcm => Inner::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key.as_bytes()).map_err(invalid)?,
            )),
            CipherAlgorithm::ChaCha20Poly1305 => Inner::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(invalid)?,
            )),
        };

        Ok(Self { algorithm, inner })
    }

    /// Engine for the unencrypted control case.
    pub fn plaintext() -> Self {
        Self {
            algorithm: CipherAlgorithm::Plaintext,
            inner: Inner::Plaintext,
        }
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CryptoEnvelope, CryptoError> {
        match &self.inner {
            Inner::Plaintext => Ok(CryptoEnvelope {
                algorithm: self.algorithm,
                nonce: Vec::new(),
                ciphertext: plaintext.to_vec(),
                tag: crc_tag(plaintext).to_vec(),
            }),
            Inner::Aes128Gcm(cipher) => seal(cipher.as_ref(), self.algorithm, plaintext),
            Inner::Aes256Gcm(cipher) => seal(cipher.as_ref(), self.algorithm, plaintext),
            Inner::ChaCha20Poly1305(cipher) => seal(cipher.as_ref(), self.algorithm, plaintext),
        }
    }

    pub fn decrypt(&self, envelope: &CryptoEnvelope) -> Result<Vec<u8>, CryptoError> {
        if envelope.algorithm != self.algorithm {
            return Err(CryptoError::EnvelopeMalformed(format!(
                "envelope sealed with {}, session uses {}",
                envelope.algorithm, self.algorithm
            )));
        }
        if envelope.nonce.len() != self.algorithm.nonce_size()
            || envelope.tag.len() != self.algorithm.tag_size()
        {
            return Err(CryptoError::EnvelopeMalformed(format!(
                "{} envelope has a {}-byte nonce and {}-byte tag",
                self.algorithm,
                envelope.nonce.len(),
                envelope.tag.len()
            )));
        }

        match &self.inner {
            Inner::Plaintext => {
                if envelope.tag != crc_tag(&envelope.ciphertext) {
                    return Err(CryptoError::AuthenticationFailed);
                }
                Ok(envelope.ciphertext.clone())
            }
            Inner::Aes128Gcm(cipher) => open(cipher.as_ref(), envelope),
            Inner::Aes256Gcm(cipher) => open(cipher.as_ref(), envelope),
            Inner::ChaCha20Poly1305(cipher) => open(cipher.as_ref(), envelope),
        }
    }
}

impl fmt::Debug for CipherEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherEngine")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn seal<A: Aead>(
    cipher: &A,
    algorithm: CipherAlgorithm,
    plaintext: &[u8],
) -> Result<CryptoEnvelope, CryptoError> {
    let nonce = A::generate_nonce(&mut OsRng);
    let aad = [algorithm.wire_tag()];
    let mut sealed = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed(format!("{} seal failed", algorithm)))?;

    let tag = sealed.split_off(sealed.len() - algorithm.tag_size());
    Ok(CryptoEnvelope {
        algorithm,
        nonce: nonce.to_vec(),
        ciphertext: sealed,
        tag,
    })
}

fn open<A: Aead>(cipher: &A, envelope: &CryptoEnvelope) -> Result<Vec<u8>, CryptoError> {
    let nonce = aead::Nonce::<A>::from_slice(&envelope.nonce);
    let aad = [envelope.algorithm.wire_tag()];

    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + envelope.tag.len());
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

fn crc_tag(payload: &[u8]) -> [u8; CRC_TAG_SIZE] {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize().to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYED: [CipherAlgorithm; 3] = [
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::ChaCha20Poly1305,
    ];

    fn key_for(algorithm: CipherAlgorithm, fill: u8) -> KeyMaterial {
        KeyMaterial::new(vec![fill; algorithm.key_size()])
    }

    #[test]
    fn round_trip_all_algorithms_and_sizes() {
        let payloads: [&[u8]; 4] = [b"", b"a", b"write-ahead log record", &[0xAB; 70_000]];

        for algorithm in KEYED {
            let engine = CipherEngine::new(algorithm, &key_for(algorithm, 0x11)).unwrap();
            for payload in payloads {
                let envelope = engine.encrypt(payload).unwrap();
                assert_eq!(envelope.nonce.len(), 12);
                assert_eq!(envelope.tag.len(), 16);
                assert_eq!(engine.decrypt(&envelope).unwrap(), payload);
            }
        }

        let engine = CipherEngine::plaintext();
        for payload in payloads {
            let envelope = engine.encrypt(payload).unwrap();
            assert_eq!(engine.decrypt(&envelope).unwrap(), payload);
        }
    }

    #[test]
    fn nonces_differ_between_calls() {
        let engine =
            CipherEngine::new(CipherAlgorithm::Aes128Gcm, &key_for(CipherAlgorithm::Aes128Gcm, 1))
                .unwrap();
        let a = engine.encrypt(b"same").unwrap();
        let b = engine.encrypt(b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let engine = CipherEngine::new(
            CipherAlgorithm::Aes256Gcm,
            &key_for(CipherAlgorithm::Aes256Gcm, 0x5A),
        )
        .unwrap();
        let envelope = engine.encrypt(b"tamper me").unwrap();

        for index in 0..envelope.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered.ciphertext[index] ^= 1 << bit;
                assert!(matches!(
                    engine.decrypt(&tampered),
                    Err(CryptoError::AuthenticationFailed)
                ));
            }
        }
        for index in 0..envelope.tag.len() {
            let mut tampered = envelope.clone();
            tampered.tag[index] ^= 0x80;
            assert!(matches!(
                engine.decrypt(&tampered),
                Err(CryptoError::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        for algorithm in KEYED {
            let a = CipherEngine::new(algorithm, &key_for(algorithm, 0xA0)).unwrap();
            let b = CipherEngine::new(algorithm, &key_for(algorithm, 0xB0)).unwrap();
            let envelope = a.encrypt(b"isolated").unwrap();
            assert!(matches!(
                b.decrypt(&envelope),
                Err(CryptoError::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn plaintext_crc_catches_corruption() {
        let engine = CipherEngine::plaintext();
        let mut envelope = engine.encrypt(b"control").unwrap();
        envelope.ciphertext[0] ^= 0x01;
        assert!(matches!(
            engine.decrypt(&envelope),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let err = CipherEngine::new(CipherAlgorithm::Aes128Gcm, &KeyMaterial::new(vec![0; 14]))
            .unwrap_err();
        assert!(matches!(err, CryptoError::KeyFormatInvalid(_)));
    }

    #[test]
    fn mismatched_algorithm_is_malformed() {
        let aes = CipherEngine::new(
            CipherAlgorithm::Aes256Gcm,
            &key_for(CipherAlgorithm::Aes256Gcm, 3),
        )
        .unwrap();
        let chacha = CipherEngine::new(
            CipherAlgorithm::ChaCha20Poly1305,
            &key_for(CipherAlgorithm::ChaCha20Poly1305, 3),
        )
        .unwrap();

        let envelope = aes.encrypt(b"x").unwrap();
        assert!(matches!(
            chacha.decrypt(&envelope),
            Err(CryptoError::EnvelopeMalformed(_))
        ));
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(
            "AES-128-GCM".parse::<CipherAlgorithm>().unwrap(),
            CipherAlgorithm::Aes128Gcm
        );
        assert_eq!(
            "aes_256_gcm".parse::<CipherAlgorithm>().unwrap(),
            CipherAlgorithm::Aes256Gcm
        );
        assert_eq!(
            "chacha20-poly1305".parse::<CipherAlgorithm>().unwrap(),
            CipherAlgorithm::ChaCha20Poly1305
        );
        assert!("rot13".parse::<CipherAlgorithm>().is_err());
        for algorithm in KEYED {
            assert_eq!(
                CipherAlgorithm::from_wire_tag(algorithm.wire_tag()),
                Some(algorithm)
            );
            assert_eq!(algorithm.to_string().parse::<CipherAlgorithm>().unwrap(), algorithm);
        }
    }
}
