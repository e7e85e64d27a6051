//! Anti-forensic information splitting for key-slot material.
//!
//! A secret of L bytes is diffused over `stripes * L` bytes so that a
//! wiped slot stays unrecoverable even when parts of the old stripe
//! region survive on disk. The diffusion rule is cryptsetup's
//! afsplitter: the running accumulator is rewritten chunk-by-chunk as
//! `H(be32(chunk_index) || chunk)`, digest-sized chunks, final partial
//! chunk truncated. Split and merge must use the identical rule or
//! nothing decrypts.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::digest::FixedOutputReset;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::digest::HashAlg;
use crate::error::LuksError;

/// Splits `secret` into `stripes` diffused stripes.
///
/// All stripes but the last are fresh random data; the last binds the
/// secret to the whole accumulated, diffused chain.
pub fn split(secret: &[u8], stripes: u32, hash: HashAlg) -> Result<Vec<u8>, LuksError> {
    check_stripes(stripes)?;
    let block = secret.len();
    let mut dst = vec![0u8; block * stripes as usize];
    let mut acc = Zeroizing::new(vec![0u8; block]);
    let mut rng = StdRng::from_entropy();

    for i in 0..stripes as usize - 1 {
        let stripe = &mut dst[i * block..(i + 1) * block];
        rng.fill_bytes(stripe);
        xor_into(&mut acc, stripe);
        diffuse(hash, &mut acc);
    }

    let last = &mut dst[(stripes as usize - 1) * block..];
    for (d, (a, s)) in last.iter_mut().zip(acc.iter().zip(secret)) {
        *d = *a ^ *s;
    }
    Ok(dst)
}

/// Recovers the secret from `data` produced by [`split`] with the same
/// stripe count and hash.
pub fn merge(data: &[u8], stripes: u32, hash: HashAlg) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    check_stripes(stripes)?;
    if data.is_empty() || data.len() % stripes as usize != 0 {
        return Err(LuksError::CorruptSlotTable(format!(
            "AF material of {} bytes does not divide into {} stripes",
            data.len(),
            stripes
        )));
    }
    let block = data.len() / stripes as usize;
    let mut acc = Zeroizing::new(vec![0u8; block]);

    for i in 0..stripes as usize - 1 {
        xor_into(&mut acc, &data[i * block..(i + 1) * block]);
        diffuse(hash, &mut acc);
    }

    let last = &data[(stripes as usize - 1) * block..];
    let mut secret = Zeroizing::new(vec![0u8; block]);
    for (s, (a, d)) in secret.iter_mut().zip(acc.iter().zip(last)) {
        *s = *a ^ *d;
    }
    Ok(secret)
}

fn check_stripes(stripes: u32) -> Result<(), LuksError> {
    if stripes < 1 {
        return Err(LuksError::CorruptSlotTable(
            "AF stripe count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn xor_into(acc: &mut [u8], stripe: &[u8]) {
    for (a, s) in acc.iter_mut().zip(stripe) {
        *a ^= *s;
    }
}

fn diffuse(hash: HashAlg, buf: &mut [u8]) {
    match hash {
        HashAlg::Sha1 => diffuse_with::<Sha1>(buf),
        HashAlg::Sha256 => diffuse_with::<Sha256>(buf),
        HashAlg::Sha512 => diffuse_with::<Sha512>(buf),
        HashAlg::Ripemd160 => diffuse_with::<Ripemd160>(buf),
    }
}

fn diffuse_with<D: Digest + FixedOutputReset>(buf: &mut [u8]) {
    let mut hasher = D::new();
    let digest_len = <D as Digest>::output_size();
    let blocks = buf.len() / digest_len;
    let tail = buf.len() % digest_len;

    for i in 0..blocks {
        let s = i * digest_len;
        Digest::update(&mut hasher, (i as u32).to_be_bytes());
        Digest::update(&mut hasher, &buf[s..s + digest_len]);
        buf[s..s + digest_len].copy_from_slice(&hasher.finalize_reset());
    }
    if tail > 0 {
        let s = blocks * digest_len;
        Digest::update(&mut hasher, (blocks as u32).to_be_bytes());
        Digest::update(&mut hasher, &buf[s..]);
        buf[s..].copy_from_slice(&hasher.finalize_reset()[..tail]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASHES: [HashAlg; 4] = [
        HashAlg::Sha1,
        HashAlg::Sha256,
        HashAlg::Sha512,
        HashAlg::Ripemd160,
    ];

    #[test]
    fn split_merge_roundtrip() {
        for hash in HASHES {
            for len in [16usize, 32, 64] {
                for stripes in [1u32, 2, 4000] {
                    let secret: Vec<u8> = (0..len).map(|i| i as u8 ^ 0x5a).collect();
                    let diffused = split(&secret, stripes, hash).unwrap();
                    assert_eq!(diffused.len(), len * stripes as usize);
                    let merged = merge(&diffused, stripes, hash).unwrap();
                    assert_eq!(merged.as_slice(), secret.as_slice(), "{hash:?} len {len} stripes {stripes}");
                }
            }
        }
    }

    #[test]
    fn single_stripe_is_identity() {
        let secret = vec![0xab_u8; 32];
        let diffused = split(&secret, 1, HashAlg::Sha256).unwrap();
        assert_eq!(diffused, secret);
    }

    #[test]
    fn split_output_is_randomized() {
        let secret = vec![7u8; 32];
        let a = split(&secret, 4, HashAlg::Sha256).unwrap();
        let b = split(&secret, 4, HashAlg::Sha256).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            merge(&a, 4, HashAlg::Sha256).unwrap().as_slice(),
            merge(&b, 4, HashAlg::Sha256).unwrap().as_slice()
        );
    }

    #[test]
    fn corrupting_any_stripe_destroys_the_secret() {
        let secret = vec![0x11_u8; 32];
        let mut diffused = split(&secret, 8, HashAlg::Sha256).unwrap();
        diffused[3] ^= 1; // one bit, in the first stripe
        let merged = merge(&diffused, 8, HashAlg::Sha256).unwrap();
        assert_ne!(merged.as_slice(), secret.as_slice());
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(matches!(
            split(&[0u8; 16], 0, HashAlg::Sha1),
            Err(LuksError::CorruptSlotTable(_))
        ));
        assert!(matches!(
            merge(&[0u8; 33], 2, HashAlg::Sha1),
            Err(LuksError::CorruptSlotTable(_))
        ));
        assert!(matches!(
            merge(&[], 1, HashAlg::Sha1),
            Err(LuksError::CorruptSlotTable(_))
        ));
    }
}
