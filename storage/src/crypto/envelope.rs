use super::cipher::CipherAlgorithm;
use super::CryptoError;

/// One sealed record: `[algorithm tag][nonce][ciphertext][auth tag]`.
///
/// Nonce and tag widths are fixed by the algorithm, so the key is the only
/// thing a reader needs besides these bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoEnvelope {
    pub algorithm: CipherAlgorithm,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl CryptoEnvelope {
    pub fn encoded_len(&self) -> usize {
        1 + self.nonce.len() + self.ciphertext.len() + self.tag.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.algorithm.wire_tag());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (&wire_tag, rest) = bytes
            .split_first()
            .ok_or_else(|| CryptoError::EnvelopeMalformed("empty envelope".into()))?;

        let algorithm = CipherAlgorithm::from_wire_tag(wire_tag).ok_or_else(|| {
            CryptoError::EnvelopeMalformed(format!("unknown algorithm tag {}", wire_tag))
        })?;

        let nonce_len = algorithm.nonce_size();
        let tag_len = algorithm.tag_size();
        if rest.len() < nonce_len + tag_len {
            return Err(CryptoError::EnvelopeMalformed(format!(
                "{} envelope needs at least {} bytes after the tag byte, got {}",
                algorithm,
                nonce_len + tag_len,
                rest.len()
            )));
        }

        let (nonce, rest) = rest.split_at(nonce_len);
        let (ciphertext, tag) = rest.split_at(rest.len() - tag_len);

        Ok(Self {
            algorithm,
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
            tag: tag.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_tag_nonce_ciphertext_tag() {
        let envelope = CryptoEnvelope {
            algorithm: CipherAlgorithm::Aes128Gcm,
            nonce: vec![1; 12],
            ciphertext: vec![2; 5],
            tag: vec![3; 16],
        };
        let bytes = envelope.to_bytes();

        assert_eq!(bytes.len(), 1 + 12 + 5 + 16);
        assert_eq!(bytes[0], CipherAlgorithm::Aes128Gcm.wire_tag());
        assert_eq!(&bytes[1..13], &[1; 12]);
        assert_eq!(&bytes[13..18], &[2; 5]);
        assert_eq!(&bytes[18..], &[3; 16]);
        assert_eq!(CryptoEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn rejects_structurally_invalid_bytes() {
        for bytes in [
            Vec::new(),
            vec![0xEE, 0, 0, 0, 0],
            {
                let mut short = vec![CipherAlgorithm::Aes256Gcm.wire_tag()];
                short.extend_from_slice(&[0; 27]);
                short
            },
        ] {
            let err = CryptoEnvelope::from_bytes(&bytes).unwrap_err();
            assert!(matches!(err, CryptoError::EnvelopeMalformed(_)), "{:?}", bytes);
        }
    }

    #[test]
    fn empty_ciphertext_is_structurally_valid() {
        let mut bytes = vec![CipherAlgorithm::ChaCha20Poly1305.wire_tag()];
        bytes.extend_from_slice(&[0; 28]);

        let envelope = CryptoEnvelope::from_bytes(&bytes).unwrap();
        assert!(envelope.ciphertext.is_empty());
        assert_eq!(envelope.tag.len(), 16);
    }
}
