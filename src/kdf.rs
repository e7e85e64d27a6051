//! PBKDF2 key stretching (RFC 2898) over the HMAC engine.
//!
//! The loop is run by hand instead of through the `pbkdf2` crate so the
//! keyed HMAC schedule is computed once per derivation and a caller's
//! cancellation flag can be polled between iteration batches. Output is
//! bit-for-bit standard PBKDF2; the RFC 6070 vectors in the tests pin
//! that down.

use std::sync::atomic::{AtomicBool, Ordering};

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

use crate::digest::HashAlg;
use crate::error::LuksError;

/// Iterations between cancellation checks. Coarse enough to stay off
/// the hot path, fine enough that an unlock abort lands within a few
/// milliseconds.
const CANCEL_POLL_MASK: u32 = 0x3ff;

/// Derives `out_len` bytes from `passphrase` and `salt`.
pub fn pbkdf2(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    alg: HashAlg,
    out_len: usize,
) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    pbkdf2_with_cancel(passphrase, salt, iterations, alg, out_len, None)
}

/// Same as [`pbkdf2`], but polls `cancel` between iteration batches.
///
/// On cancellation all partial state is zeroed and `Cancelled` is
/// returned; no partial key ever escapes.
pub fn pbkdf2_with_cancel(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    alg: HashAlg,
    out_len: usize,
    cancel: Option<&AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    if iterations < 1 {
        return Err(LuksError::InvalidIterationCount);
    }
    match alg {
        HashAlg::Sha1 => derive::<Hmac<Sha1>>(passphrase, salt, iterations, out_len, cancel),
        HashAlg::Sha256 => derive::<Hmac<Sha256>>(passphrase, salt, iterations, out_len, cancel),
        HashAlg::Sha512 => derive::<Hmac<Sha512>>(passphrase, salt, iterations, out_len, cancel),
        HashAlg::Ripemd160 => {
            derive::<Hmac<Ripemd160>>(passphrase, salt, iterations, out_len, cancel)
        }
    }
}

fn derive<M: Mac + KeyInit + Clone>(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    out_len: usize,
    cancel: Option<&AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    let prf = <M as KeyInit>::new_from_slice(passphrase).expect("hmac accepts any key length");
    let hash_len = <M as hmac::digest::OutputSizeUser>::output_size();

    let mut out = Zeroizing::new(vec![0u8; out_len]);
    // Block counter is 1-based big-endian, per RFC 2898.
    let mut block_index: u32 = 1;

    for chunk in out.chunks_mut(hash_len) {
        let mut mac = prf.clone();
        mac.update(salt);
        mac.update(&block_index.to_be_bytes());
        let mut u = Zeroizing::new(mac.finalize().into_bytes().to_vec());
        let mut t = Zeroizing::new(u.to_vec());

        for i in 1..iterations {
            let mut mac = prf.clone();
            mac.update(&u);
            let mut raw = mac.finalize().into_bytes();
            u.copy_from_slice(&raw[..]);
            raw.as_mut_slice().fill(0);
            for (t, u) in t.iter_mut().zip(u.iter()) {
                *t ^= *u;
            }
            if i & CANCEL_POLL_MASK == 0 {
                if let Some(flag) = cancel {
                    if flag.load(Ordering::Relaxed) {
                        return Err(LuksError::Cancelled);
                    }
                }
            }
        }

        let take = chunk.len();
        chunk.copy_from_slice(&t[..take]);
        block_index += 1;
    }

    Ok(out)
}
