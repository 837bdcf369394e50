// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Optional byte-oriented stream cipher, invoked through a factory
//! contract (§1, §6). The core never hard-codes a concrete cipher: a
//! `DbOptions` may carry a `Arc<dyn CipherFactory>`, and the database
//! encrypts/decrypts file contents in place through the `StreamCipher`
//! trait object it returns.

use crate::util::status::{AcdpError, Result, Status};

/// A cipher with 1-byte operating granularity, so any contiguous byte
/// range of a WR data file can be encrypted/decrypted in place without
/// block-alignment padding.
pub trait StreamCipher: Send + Sync {
    fn apply(&mut self, offset: u64, data: &mut [u8]) -> Result<()>;
}

pub trait CipherFactory: Send + Sync {
    /// Creates and initializes a cipher for WR use; `encrypt` selects
    /// encrypt vs. decrypt orientation where the underlying primitive
    /// distinguishes the two (stream ciphers built on a block cipher in
    /// CTR mode do not need to, but the contract still carries the flag
    /// for primitives that do).
    fn create_and_init_wr_cipher(&self, encrypt: bool) -> Result<Box<dyn StreamCipher>>;

    /// Creates an RO cipher without initializing its key material; the
    /// RO conversion path out of scope per §1 uses this together with
    /// `init_ro_cipher` at load time.
    fn create_ro_cipher(&self) -> Result<Box<dyn StreamCipher>>;

    fn init_ro_cipher(&self, cipher: &mut dyn StreamCipher, encrypt: bool) -> Result<()>;
}

/// A well-known plaintext, encrypted and persisted as `cipherChallenge`
/// at layout-write time; re-encrypting it at open time and comparing
/// verifies the configured cipher before any table is touched.
pub const CIPHER_CHALLENGE_PLAINTEXT: &[u8] = b"acdp-cipher-challenge-v1";

pub fn verify_challenge(
    factory: &dyn CipherFactory,
    persisted_ciphertext: &[u8],
) -> Result<()> {
    let mut cipher = factory.create_and_init_wr_cipher(true)?;
    let mut buf = CIPHER_CHALLENGE_PLAINTEXT.to_vec();
    cipher
        .apply(0, &mut buf)
        .map_err(|e| AcdpError::with_source(Status::Crypto, "cipher challenge encryption failed", e))?;
    if buf != persisted_ciphertext {
        return Err(AcdpError::new(
            Status::Crypto,
            Some("cipher challenge mismatch: wrong cipher or key for this database"),
        ));
    }
    Ok(())
}

/// The no-op factory used when a database has no `cipherFactoryClassName`
/// configured.
pub struct NullCipherFactory;

struct NullCipher;

impl StreamCipher for NullCipher {
    fn apply(&mut self, _offset: u64, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

impl CipherFactory for NullCipherFactory {
    fn create_and_init_wr_cipher(&self, _encrypt: bool) -> Result<Box<dyn StreamCipher>> {
        Ok(Box::new(NullCipher))
    }

    fn create_ro_cipher(&self) -> Result<Box<dyn StreamCipher>> {
        Ok(Box::new(NullCipher))
    }

    fn init_ro_cipher(&self, _cipher: &mut dyn StreamCipher, _encrypt: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "crypto")]
pub mod aes_ctr {
    //! A concrete byte-oriented stream cipher for callers that don't
    //! supply their own: AES-128 in CTR mode, which is naturally
    //! byte-granular (the keystream is generated per 16-byte block but
    //! XORed at whatever offset is requested, so seeking to an arbitrary
    //! byte is just a counter-block recomputation).

    use super::*;
    use aes::Aes128;
    use ctr::cipher::{KeyIvInit, StreamCipher as _, StreamCipherSeek};
    use ctr::Ctr128BE;

    type Aes128Ctr = Ctr128BE<Aes128>;

    pub struct AesCtrCipherFactory {
        key: [u8; 16],
        iv: [u8; 16],
    }

    impl AesCtrCipherFactory {
        pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
            Self { key, iv }
        }
    }

    pub struct AesCtrCipher {
        inner: Aes128Ctr,
    }

    impl StreamCipher for AesCtrCipher {
        fn apply(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
            self.inner
                .try_seek(offset)
                .map_err(|e| AcdpError::with_source(Status::Crypto, "cipher seek failed", StreamPositionError(e.to_string())))?;
            self.inner.apply_keystream(data);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct StreamPositionError(String);
    impl std::fmt::Display for StreamPositionError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for StreamPositionError {}

    impl CipherFactory for AesCtrCipherFactory {
        fn create_and_init_wr_cipher(&self, _encrypt: bool) -> Result<Box<dyn StreamCipher>> {
            let inner = Aes128Ctr::new(&self.key.into(), &self.iv.into());
            Ok(Box::new(AesCtrCipher { inner }))
        }

        fn create_ro_cipher(&self) -> Result<Box<dyn StreamCipher>> {
            self.create_and_init_wr_cipher(true)
        }

        fn init_ro_cipher(&self, _cipher: &mut dyn StreamCipher, _encrypt: bool) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_cipher_is_a_no_op() {
        let factory = NullCipherFactory;
        let mut cipher = factory.create_and_init_wr_cipher(true).unwrap();
        let mut data = b"hello".to_vec();
        cipher.apply(0, &mut data).unwrap();
        assert_eq!(&data, b"hello");
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn aes_ctr_round_trips_and_is_byte_granular() {
        use aes_ctr::AesCtrCipherFactory;
        let factory = AesCtrCipherFactory::new([1u8; 16], [2u8; 16]);
        let mut enc = factory.create_and_init_wr_cipher(true).unwrap();
        let mut data = b"hello world, acdp".to_vec();
        let original = data.clone();
        enc.apply(0, &mut data).unwrap();
        assert_ne!(data, original);
        let mut dec = factory.create_and_init_wr_cipher(false).unwrap();
        dec.apply(0, &mut data).unwrap();
        assert_eq!(data, original);
    }
}
