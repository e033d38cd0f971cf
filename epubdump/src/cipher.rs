//! AES block cipher with CBC chaining and PKCS7 padding.
//!
//! Calls whose buffer is not a whole number of blocks are no-ops and leave the
//! buffer and IV untouched, so callers validate alignment before decrypting.
//! The implementation is table based and not constant time; it exists to read
//! protected files offline.

use zeroize::Zeroize;

use crate::tables::{
    GMUL11, GMUL13, GMUL14, GMUL2, GMUL3, GMUL9, RCON, SBOX, SBOX_INV, SHIFT_ROWS, SHIFT_ROWS_INV,
};

pub const BLOCK_SIZE: usize = 16;
pub const AES128_KEY_SIZE: usize = 16;
pub const AES256_KEY_SIZE: usize = 32;

const AES128_ROUNDS: usize = 11;
const AES256_ROUNDS: usize = 15;
const MAX_KEY_WORDS: usize = AES256_ROUNDS * 4;

pub type Block = [u8; BLOCK_SIZE];

/// Expanded key material for one encrypt or decrypt call.
struct RoundKeys<const R: usize>([Block; R]);

impl<const R: usize> RoundKeys<R> {
    fn expand<const K: usize>(key: &[u8; K]) -> Self {
        let nk = K / 4;
        let mut words = [[0u8; 4]; MAX_KEY_WORDS];
        for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
            word.copy_from_slice(chunk);
        }

        for i in nk..R * 4 {
            let mut t = words[i - 1];
            if i % nk == 0 {
                t.rotate_left(1);
                sub_bytes(&mut t);
                t[0] ^= RCON[i / nk];
            } else if nk > 6 && i % nk == 4 {
                sub_bytes(&mut t);
            }
            let prev = words[i - nk];
            for (b, p) in t.iter_mut().zip(prev) {
                *b ^= p;
            }
            words[i] = t;
        }

        let mut keys = [[0u8; BLOCK_SIZE]; R];
        for (round, key) in keys.iter_mut().enumerate() {
            for (column, word) in key.chunks_exact_mut(4).zip(&words[round * 4..]) {
                column.copy_from_slice(word);
            }
        }
        words.zeroize();
        Self(keys)
    }

    fn encrypt_block(&self, state: &mut Block) {
        add_round_key(state, &self.0[0]);
        for key in &self.0[1..R - 1] {
            sub_bytes(state);
            shift_rows(state);
            mix_columns(state);
            add_round_key(state, key);
        }
        sub_bytes(state);
        shift_rows(state);
        add_round_key(state, &self.0[R - 1]);
    }

    fn decrypt_block(&self, state: &mut Block) {
        add_round_key(state, &self.0[R - 1]);
        for key in self.0[1..R - 1].iter().rev() {
            shift_rows_inv(state);
            sub_bytes_inv(state);
            add_round_key(state, key);
            mix_columns_inv(state);
        }
        shift_rows_inv(state);
        sub_bytes_inv(state);
        add_round_key(state, &self.0[0]);
    }
}

impl<const R: usize> Drop for RoundKeys<R> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn add_round_key(state: &mut Block, key: &Block) {
    for (s, k) in state.iter_mut().zip(key) {
        *s ^= k;
    }
}

fn sub_bytes(bytes: &mut [u8]) {
    for b in bytes {
        *b = SBOX[*b as usize];
    }
}

fn sub_bytes_inv(bytes: &mut [u8]) {
    for b in bytes {
        *b = SBOX_INV[*b as usize];
    }
}

fn shift_rows(state: &mut Block) {
    let temp = *state;
    for (s, &from) in state.iter_mut().zip(&SHIFT_ROWS) {
        *s = temp[from];
    }
}

fn shift_rows_inv(state: &mut Block) {
    let temp = *state;
    for (s, &from) in state.iter_mut().zip(&SHIFT_ROWS_INV) {
        *s = temp[from];
    }
}

fn mix_columns(state: &mut Block) {
    for col in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [col[0], col[1], col[2], col[3]].map(usize::from);
        col[0] = GMUL2[a0] ^ GMUL3[a1] ^ a2 as u8 ^ a3 as u8;
        col[1] = GMUL2[a1] ^ GMUL3[a2] ^ a3 as u8 ^ a0 as u8;
        col[2] = GMUL2[a2] ^ GMUL3[a3] ^ a0 as u8 ^ a1 as u8;
        col[3] = GMUL2[a3] ^ GMUL3[a0] ^ a1 as u8 ^ a2 as u8;
    }
}

fn mix_columns_inv(state: &mut Block) {
    for col in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [col[0], col[1], col[2], col[3]].map(usize::from);
        col[0] = GMUL14[a0] ^ GMUL11[a1] ^ GMUL13[a2] ^ GMUL9[a3];
        col[1] = GMUL14[a1] ^ GMUL11[a2] ^ GMUL13[a3] ^ GMUL9[a0];
        col[2] = GMUL14[a2] ^ GMUL11[a3] ^ GMUL13[a0] ^ GMUL9[a1];
        col[3] = GMUL14[a3] ^ GMUL11[a0] ^ GMUL13[a1] ^ GMUL9[a2];
    }
}

fn cbc_encrypt<const K: usize, const R: usize>(data: &mut [u8], key: &[u8; K], iv: &mut Block) {
    if data.len() % BLOCK_SIZE != 0 {
        return;
    }
    let keys = RoundKeys::<R>::expand(key);
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let mut block = *iv;
        for (b, p) in block.iter_mut().zip(chunk.iter()) {
            *b ^= p;
        }
        keys.encrypt_block(&mut block);
        chunk.copy_from_slice(&block);
        *iv = block;
    }
}

fn cbc_decrypt<const K: usize, const R: usize>(data: &mut [u8], key: &[u8; K], iv: &mut Block) {
    if data.len() % BLOCK_SIZE != 0 {
        return;
    }
    let keys = RoundKeys::<R>::expand(key);
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let mut ciphertext = [0u8; BLOCK_SIZE];
        ciphertext.copy_from_slice(chunk);
        let mut block = ciphertext;
        keys.decrypt_block(&mut block);
        add_round_key(&mut block, iv);
        chunk.copy_from_slice(&block);
        *iv = ciphertext;
    }
}

fn pkcs7_pad(data: &mut Vec<u8>) {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    data.resize(data.len() + pad, pad as u8);
}

/// Drops as many trailing bytes as the last byte says. The pad bytes
/// themselves are not checked.
fn pkcs7_unpad(data: &mut Vec<u8>) {
    if let Some(&pad) = data.last() {
        data.truncate(data.len().saturating_sub(pad as usize));
    }
}

pub fn aes128_cbc_encrypt(data: &mut [u8], key: &[u8; AES128_KEY_SIZE], iv: &mut Block) {
    cbc_encrypt::<AES128_KEY_SIZE, AES128_ROUNDS>(data, key, iv)
}

pub fn aes128_cbc_decrypt(data: &mut [u8], key: &[u8; AES128_KEY_SIZE], iv: &mut Block) {
    cbc_decrypt::<AES128_KEY_SIZE, AES128_ROUNDS>(data, key, iv)
}

/// Pads `data` to a whole number of blocks and encrypts it.
pub fn aes128_cbc_pkcs7_encrypt(data: &mut Vec<u8>, key: &[u8; AES128_KEY_SIZE], iv: &mut Block) {
    pkcs7_pad(data);
    aes128_cbc_encrypt(data, key, iv);
}

/// Decrypts `data` and strips its padding.
pub fn aes128_cbc_pkcs7_decrypt(data: &mut Vec<u8>, key: &[u8; AES128_KEY_SIZE], iv: &mut Block) {
    if data.len() % BLOCK_SIZE != 0 {
        return;
    }
    aes128_cbc_decrypt(data, key, iv);
    pkcs7_unpad(data);
}

pub fn aes256_cbc_encrypt(data: &mut [u8], key: &[u8; AES256_KEY_SIZE], iv: &mut Block) {
    cbc_encrypt::<AES256_KEY_SIZE, AES256_ROUNDS>(data, key, iv)
}

pub fn aes256_cbc_decrypt(data: &mut [u8], key: &[u8; AES256_KEY_SIZE], iv: &mut Block) {
    cbc_decrypt::<AES256_KEY_SIZE, AES256_ROUNDS>(data, key, iv)
}

pub fn aes256_cbc_pkcs7_encrypt(data: &mut Vec<u8>, key: &[u8; AES256_KEY_SIZE], iv: &mut Block) {
    pkcs7_pad(data);
    aes256_cbc_encrypt(data, key, iv);
}

pub fn aes256_cbc_pkcs7_decrypt(data: &mut Vec<u8>, key: &[u8; AES256_KEY_SIZE], iv: &mut Block) {
    if data.len() % BLOCK_SIZE != 0 {
        return;
    }
    aes256_cbc_decrypt(data, key, iv);
    pkcs7_unpad(data);
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const IV: &str = "000102030405060708090a0b0c0d0e0f";
    const PLAINTEXT: &str = concat!(
        "6bc1bee22e409f96e93d7e117393172a",
        "ae2d8a571e03ac9c9eb76fac45af8e51",
        "30c81c46a35ce411e5fbc1191a0a52ef",
        "f69f2445df4f9b17ad2b417be66c3710",
    );

    fn decode<const N: usize>(s: &str) -> [u8; N] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_aes128_cbc_vector() {
        let key = decode::<16>("2b7e151628aed2a6abf7158809cf4f3c");
        let expected = hex::decode(concat!(
            "7649abac8119b246cee98e9b12e9197d",
            "5086cb9b507219ee95db113a917678b2",
            "73bed6b8e3c1743b7116e69e22229516",
            "3ff1caa1681fac09120eca307586e1a7",
        ))
        .unwrap();

        let mut data = hex::decode(PLAINTEXT).unwrap();
        let mut iv = decode::<16>(IV);
        aes128_cbc_encrypt(&mut data, &key, &mut iv);
        assert_eq!(data, expected);
        assert_eq!(&iv[..], &expected[48..]);

        let mut iv = decode::<16>(IV);
        aes128_cbc_decrypt(&mut data, &key, &mut iv);
        assert_eq!(data, hex::decode(PLAINTEXT).unwrap());
        assert_eq!(&iv[..], &expected[48..]);
    }

    #[test]
    fn test_aes256_cbc_vector() {
        let key =
            decode::<32>("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let expected = hex::decode(concat!(
            "f58c4c04d6e5f1ba779eabfb5f7bfbd6",
            "9cfc4e967edb808d679f777bc6702c7d",
            "39f23369a9d9bacfa530e26304231461",
            "b2eb05e2c39be9fcda6c19078c6a9d1b",
        ))
        .unwrap();

        let mut data = hex::decode(PLAINTEXT).unwrap();
        let mut iv = decode::<16>(IV);
        aes256_cbc_encrypt(&mut data, &key, &mut iv);
        assert_eq!(data, expected);

        let mut iv = decode::<16>(IV);
        aes256_cbc_decrypt(&mut data, &key, &mut iv);
        assert_eq!(data, hex::decode(PLAINTEXT).unwrap());
    }

    #[test]
    fn test_chained_calls_match_single_call() {
        let key = [7u8; 16];
        let plain: Vec<u8> = (0..64u8).collect();

        let mut whole = plain.clone();
        let mut iv = [1u8; 16];
        aes128_cbc_encrypt(&mut whole, &key, &mut iv);

        let mut parts = plain.clone();
        let mut iv = [1u8; 16];
        let (head, tail) = parts.split_at_mut(32);
        aes128_cbc_encrypt(head, &key, &mut iv);
        aes128_cbc_encrypt(tail, &key, &mut iv);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_unaligned_is_noop() {
        let key = [3u8; 16];
        let mut data = vec![0xAA; 17];
        let mut iv = [9u8; 16];
        aes128_cbc_encrypt(&mut data, &key, &mut iv);
        assert_eq!(data, vec![0xAA; 17]);
        assert_eq!(iv, [9u8; 16]);

        aes128_cbc_pkcs7_decrypt(&mut data, &key, &mut iv);
        assert_eq!(data, vec![0xAA; 17]);
        assert_eq!(iv, [9u8; 16]);
    }

    #[test]
    fn test_pkcs7_full_block_pad() {
        let key = [5u8; 16];
        let mut data = vec![0u8; 16];
        aes128_cbc_pkcs7_encrypt(&mut data, &key, &mut [0u8; 16]);
        assert_eq!(data.len(), 32);
    }

    #[test]
    fn test_unpad_does_not_check_pad_bytes() {
        let mut data = vec![1, 2, 3, 4, 9, 9, 3];
        pkcs7_unpad(&mut data);
        assert_eq!(data, vec![1, 2, 3, 4]);

        let mut data = vec![1, 200];
        pkcs7_unpad(&mut data);
        assert!(data.is_empty());
    }

    #[test]
    fn test_matches_rustcrypto() {
        use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
        use cbc::cipher::block_padding::Pkcs7;

        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plain = b"The quick brown fox jumps over the lazy dog".to_vec();

        let reference = cbc::Encryptor::<aes::Aes128>::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plain);

        let mut data = plain.clone();
        aes128_cbc_pkcs7_encrypt(&mut data, &key, &mut iv.clone());
        assert_eq!(data, reference);

        let decrypted = cbc::Decryptor::<aes::Aes128>::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&data)
            .unwrap();
        assert_eq!(decrypted, plain);
    }

    proptest! {
        #[test]
        fn roundtrip_aligned_128(
            blocks in proptest::collection::vec(any::<[u8; 16]>(), 1..16),
            key in any::<[u8; 16]>(),
            iv in any::<[u8; 16]>(),
        ) {
            let plain = blocks.concat();
            let mut data = plain.clone();
            let mut enc_iv = iv;
            aes128_cbc_encrypt(&mut data, &key, &mut enc_iv);
            let mut dec_iv = iv;
            aes128_cbc_decrypt(&mut data, &key, &mut dec_iv);
            prop_assert_eq!(data, plain);
            prop_assert_eq!(dec_iv, enc_iv);
        }

        #[test]
        fn roundtrip_aligned_256(
            blocks in proptest::collection::vec(any::<[u8; 16]>(), 1..16),
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
        ) {
            let plain = blocks.concat();
            let mut data = plain.clone();
            let mut enc_iv = iv;
            aes256_cbc_encrypt(&mut data, &key, &mut enc_iv);
            let mut dec_iv = iv;
            aes256_cbc_decrypt(&mut data, &key, &mut dec_iv);
            prop_assert_eq!(data, plain);
            prop_assert_eq!(dec_iv, enc_iv);
        }

        #[test]
        fn roundtrip_pkcs7(
            plain in proptest::collection::vec(any::<u8>(), 0..200),
            key in any::<[u8; 16]>(),
            iv in any::<[u8; 16]>(),
        ) {
            let mut data = plain.clone();
            aes128_cbc_pkcs7_encrypt(&mut data, &key, &mut iv.clone());
            prop_assert_eq!(data.len() % BLOCK_SIZE, 0);
            aes128_cbc_pkcs7_decrypt(&mut data, &key, &mut iv.clone());
            prop_assert_eq!(data, plain);
        }

        #[test]
        fn roundtrip_pkcs7_256(
            plain in proptest::collection::vec(any::<u8>(), 0..200),
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
        ) {
            let mut data = plain.clone();
            aes256_cbc_pkcs7_encrypt(&mut data, &key, &mut iv.clone());
            aes256_cbc_pkcs7_decrypt(&mut data, &key, &mut iv.clone());
            prop_assert_eq!(data, plain);
        }
    }
}
