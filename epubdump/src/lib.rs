//! Writes decrypted copies of EPUB archives whose members are protected with
//! AES-128-CBC, as listed in `META-INF/encryption.xml`.
//!
//! Protected members are stored as a 16 byte IV followed by the ciphertext of
//! the PKCS7 padded, raw deflated resource. Everything else is copied through
//! untouched.

mod capture;
pub mod cipher;
mod container;
mod dumper;
mod entry;
mod error;
mod ext;
mod manifest;
mod tables;

pub use {capture::*, container::*, dumper::*, error::*};
pub use manifest::{
    Manifest, AES128_CBC_ALGORITHM, CONTAINER_PATH, ENCRYPTION_PATH, RIGHTS_PATH,
};
