//! Lookup tables for the AES round transforms.
//!
//! Everything here is evaluated at compile time from the field's reduction
//! polynomial and the affine constant, so the tables are frozen data that
//! never needs initialisation or teardown.

/// Reduction polynomial of GF(2^8) used by Rijndael.
const REDUCTION_POLYNOMIAL: u16 = 0x11B;
/// Additive constant of the S-box affine transform.
const AFFINE_CONSTANT: u8 = 0x63;

pub(crate) const SBOX: [u8; 256] = generate_sbox(REDUCTION_POLYNOMIAL, AFFINE_CONSTANT);
pub(crate) const SBOX_INV: [u8; 256] = invert_sbox(&SBOX);

pub(crate) const GMUL2: [u8; 256] = generate_gmul(2);
pub(crate) const GMUL3: [u8; 256] = generate_gmul(3);
pub(crate) const GMUL9: [u8; 256] = generate_gmul(9);
pub(crate) const GMUL11: [u8; 256] = generate_gmul(11);
pub(crate) const GMUL13: [u8; 256] = generate_gmul(13);
pub(crate) const GMUL14: [u8; 256] = generate_gmul(14);

/// Round constants, indexed from 1.
pub(crate) const RCON: [u8; 16] = [
    0x8D, 0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1B, 0x36, 0x6C, 0xD8, 0xAB, 0x4D, 0x9A,
];

/// Source byte for each state position after ShiftRows.
pub(crate) const SHIFT_ROWS: [usize; 16] = [0, 5, 10, 15, 4, 9, 14, 3, 8, 13, 2, 7, 12, 1, 6, 11];
pub(crate) const SHIFT_ROWS_INV: [usize; 16] =
    [0, 13, 10, 7, 4, 1, 14, 11, 8, 5, 2, 15, 12, 9, 6, 3];

const fn generate_sbox(poly: u16, affine: u8) -> [u8; 256] {
    // powers of the generator 0x03; the inverse of 3^i is 3^(255 - i)
    let mut pow = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 256 {
        pow[i] = x as u8;
        x ^= (x << 1) ^ ((x >> 7) * poly);
        i += 1;
    }

    let mut sbox = [0u8; 256];
    // zero has no inverse and maps straight through the affine transform
    sbox[0] = affine;
    let mut i = 0;
    while i < 255 {
        let inv = pow[255 - i];
        sbox[pow[i] as usize] = inv
            ^ inv.rotate_left(1)
            ^ inv.rotate_left(2)
            ^ inv.rotate_left(3)
            ^ inv.rotate_left(4)
            ^ affine;
        i += 1;
    }
    sbox
}

const fn invert_sbox(sbox: &[u8; 256]) -> [u8; 256] {
    let mut inv = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        inv[sbox[i] as usize] = i as u8;
        i += 1;
    }
    inv
}

const fn generate_gmul(mul: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut a = mul;
        let mut b = i as u8;
        let mut p = 0u8;
        let mut j = 0;
        while j < 8 {
            if b & 1 != 0 {
                p ^= a;
            }
            let hi = a & 0x80 != 0;
            a <<= 1;
            if hi {
                a ^= (REDUCTION_POLYNOMIAL & 0xFF) as u8;
            }
            b >>= 1;
            j += 1;
        }
        table[i] = p;
        i += 1;
    }
    table
}
