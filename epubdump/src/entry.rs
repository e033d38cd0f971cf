use std::io::Read;

use tracing::warn;

use crate::cipher::{self, AES128_KEY_SIZE, BLOCK_SIZE};

/// Upper bound on the up-front allocation for a declared resource size.
pub(crate) const MAX_PREALLOCATION: u64 = 16 << 20;

/// Decodes one protected resource.
///
/// `data` is the member as stored in the archive: a 16 byte IV followed by
/// AES-128-CBC ciphertext of the PKCS7 padded, raw deflated resource. The
/// inflated result must be exactly `size` bytes long.
pub(crate) fn decrypt(mut data: Vec<u8>, key: &[u8], size: u64) -> Result<Vec<u8>, super::Error> {
    if key.is_empty() {
        warn!("unable to decrypt without key, keeping encrypted data");
        return Ok(data);
    }
    let key: &[u8; AES128_KEY_SIZE] = key
        .try_into()
        .map_err(|_| super::Error::KeyLength(key.len()))?;

    if data.len() <= BLOCK_SIZE {
        return Err(super::Error::Truncated(data.len()));
    }
    let mut ciphertext = data.split_off(BLOCK_SIZE);
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(super::Error::Unaligned(ciphertext.len()));
    }
    let mut iv = [0; BLOCK_SIZE];
    iv.copy_from_slice(&data);

    cipher::aes128_cbc_pkcs7_decrypt(&mut ciphertext, key, &mut iv);

    inflate(&ciphertext, size)
}

/// Raw (headerless) inflate into a buffer of the declared size.
fn inflate(compressed: &[u8], size: u64) -> Result<Vec<u8>, super::Error> {
    let mut buf = Vec::with_capacity(size.min(MAX_PREALLOCATION) as usize);
    // one byte past the declared size is enough to detect overlong output
    flate2::read::DeflateDecoder::new(compressed)
        .take(size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(super::Error::Inflate)?;
    if buf.len() as u64 != size {
        return Err(super::Error::SizeMismatch {
            expected: size,
            actual: buf.len() as u64,
        });
    }
    Ok(buf)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn protect(plain: &[u8], key: &[u8; 16], iv: [u8; 16]) -> Vec<u8> {
        let mut deflate =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        deflate.write_all(plain).unwrap();
        let mut body = deflate.finish().unwrap();
        cipher::aes128_cbc_pkcs7_encrypt(&mut body, key, &mut iv.clone());
        let mut out = iv.to_vec();
        out.extend(body);
        out
    }

    #[test]
    fn test_decrypt() {
        let key = [0x11; 16];
        let plain = b"<html><body>chapter one</body></html>".repeat(20);
        let data = protect(&plain, &key, [0x22; 16]);
        let out = decrypt(data, &key, plain.len() as u64).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_size_mismatch() {
        let key = [0x11; 16];
        let plain = b"0123456789".to_vec();
        let data = protect(&plain, &key, [0x22; 16]);
        match decrypt(data.clone(), &key, 11) {
            Err(super::super::Error::SizeMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (11, 10))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            decrypt(data, &key, 4),
            Err(super::super::Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_key() {
        let plain = b"some text that compresses, some text that compresses".to_vec();
        let data = protect(&plain, &[0x11; 16], [0x22; 16]);
        assert!(decrypt(data, &[0x12; 16], plain.len() as u64).is_err());
    }

    #[test]
    fn test_without_key_returns_raw() {
        let data = vec![1, 2, 3];
        assert_eq!(decrypt(data.clone(), &[], 10).unwrap(), data);
    }

    #[test]
    fn test_malformed() {
        let key = [0u8; 16];
        assert!(matches!(
            decrypt(vec![0; 16], &key, 1),
            Err(super::super::Error::Truncated(16))
        ));
        assert!(matches!(
            decrypt(vec![0; 20], &key, 1),
            Err(super::super::Error::Unaligned(4))
        ));
        assert!(matches!(
            decrypt(vec![0; 32], &key[..8], 1),
            Err(super::super::Error::KeyLength(8))
        ));
    }
}
