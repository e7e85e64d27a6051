//! Hash and HMAC dispatch for the algorithms a LUKS1 header may name.
//!
//! The header stores the hash as a string; everything downstream
//! (PBKDF2, anti-forensic diffusion, the master-key digest) goes
//! through [`HashAlg`] so an unknown name is rejected once, at parse
//! time, instead of deep inside the unlock path.

use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::LuksError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha512,
    Ripemd160,
}

impl HashAlg {
    /// Looks up an algorithm from its on-disk header name.
    pub fn from_name(name: &str) -> Result<Self, LuksError> {
        match name {
            "sha1" => Ok(HashAlg::Sha1),
            "sha256" => Ok(HashAlg::Sha256),
            "sha512" => Ok(HashAlg::Sha512),
            "ripemd160" => Ok(HashAlg::Ripemd160),
            other => Err(LuksError::UnsupportedHash(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha512 => "sha512",
            HashAlg::Ripemd160 => "ripemd160",
        }
    }

    /// Digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlg::Sha1 | HashAlg::Ripemd160 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha512 => 64,
        }
    }

    /// Internal block length in bytes (the HMAC pad width).
    pub fn block_len(&self) -> usize {
        match self {
            HashAlg::Sha512 => 128,
            _ => 64,
        }
    }

    /// One-shot digest of `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha1 => Sha1::digest(data).to_vec(),
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha512 => Sha512::digest(data).to_vec(),
            HashAlg::Ripemd160 => Ripemd160::digest(data).to_vec(),
        }
    }

    /// One-shot HMAC of `data` under `key`.
    ///
    /// The hmac crate applies the usual rule for oversized keys (hash
    /// first, then pad to the block length). PBKDF2 does not use this
    /// entry point; it clones a keyed context per iteration instead to
    /// reuse the key schedule.
    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        macro_rules! one_shot {
            ($hash:ty) => {{
                let mut m = Hmac::<$hash>::new_from_slice(key)
                    .expect("hmac accepts any key length");
                m.update(data);
                m.finalize().into_bytes().to_vec()
            }};
        }
        match self {
            HashAlg::Sha1 => one_shot!(Sha1),
            HashAlg::Sha256 => one_shot!(Sha256),
            HashAlg::Sha512 => one_shot!(Sha512),
            HashAlg::Ripemd160 => one_shot!(Ripemd160),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_known_answers() {
        assert_eq!(
            hex::encode(HashAlg::Sha1.digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hex::encode(HashAlg::Sha256.digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex::encode(HashAlg::Sha512.digest(b"abc")),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
        assert_eq!(
            hex::encode(HashAlg::Ripemd160.digest(b"abc")),
            "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc"
        );
    }

    #[test]
    fn hmac_sha256_rfc4231_case2() {
        let mac = HashAlg::Sha256.hmac(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hmac_key_longer_than_block_is_hashed_first() {
        let long_key = vec![0xaa_u8; 200];
        let direct = HashAlg::Sha256.hmac(&long_key, b"payload");
        let hashed = HashAlg::Sha256.digest(&long_key);
        let via_hashed_key = HashAlg::Sha256.hmac(&hashed, b"payload");
        assert_eq!(direct, via_hashed_key);
    }

    #[test]
    fn name_lookup() {
        assert_eq!(HashAlg::from_name("sha256").unwrap(), HashAlg::Sha256);
        assert_eq!(HashAlg::from_name("ripemd160").unwrap(), HashAlg::Ripemd160);
        assert!(matches!(
            HashAlg::from_name("md5"),
            Err(LuksError::UnsupportedHash(_))
        ));
        for alg in [HashAlg::Sha1, HashAlg::Sha256, HashAlg::Sha512, HashAlg::Ripemd160] {
            assert_eq!(HashAlg::from_name(alg.name()).unwrap(), alg);
        }
    }
}
