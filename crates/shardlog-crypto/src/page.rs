//! Page decryption and encryption.
//!
//! Raw page layout (`reserve` from the profile):
//!
//! ```text
//! [salt (page 0 only)][ciphertext][IV (16)][HMAC tag][pad]
//!                                 ^ page_size - reserve
//! ```
//!
//! The tag covers everything from the start of the ciphertext through the IV,
//! followed by the little-endian 1-based page number. Decrypted pages keep the
//! raw trailer; page 0 gets the SQLite header in place of the salt.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha512;

use crate::kdf::{derive_keys, PageKeys, KEY_SIZE, SALT_SIZE};
use crate::profile::{CipherProfile, HmacDigest, IV_SIZE};
use crate::{CryptoError, Result};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// Header every plaintext SQLite database starts with.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Decrypt one raw page.
///
/// `raw` must be exactly one page long. An all-zero page decodes to an
/// all-zero page without authentication.
pub fn decrypt_page(raw: &[u8], page_index: u64, keys: &PageKeys, profile: CipherProfile) -> Result<Vec<u8>> {
    let page_size = profile.page_size();
    check_page_len(raw, page_size)?;

    if raw.iter().all(|&b| b == 0) {
        return Ok(vec![0u8; page_size]);
    }

    let data_start = data_start(page_index);
    let body_end = page_size - profile.reserve();
    let tag_start = body_end + IV_SIZE;
    let tag = &raw[tag_start..tag_start + profile.hmac_size()];

    if !verify_tag(keys, profile.digest(), &raw[data_start..tag_start], page_index, tag)? {
        tracing::debug!(page = page_index, profile = %profile.name(), "page tag mismatch");
        return Err(CryptoError::AuthenticationFailed { page: page_index });
    }

    let mut out = vec![0u8; page_size];
    out[data_start..body_end].copy_from_slice(&raw[data_start..body_end]);
    let iv = &raw[body_end..body_end + IV_SIZE];
    Aes256CbcDec::new_from_slices(keys.enc_key(), iv)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut out[data_start..body_end])
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    if page_index == 0 {
        out[..SALT_SIZE].copy_from_slice(SQLITE_HEADER);
    }
    out[body_end..].copy_from_slice(&raw[body_end..]);
    Ok(out)
}

/// Encrypt one plaintext page; the inverse of [`decrypt_page`].
///
/// The plaintext's own reserve trailer is discarded. For page 0 the first
/// 16 plaintext bytes (the SQLite header) are replaced with `salt`.
pub fn encrypt_page(
    plain: &[u8],
    page_index: u64,
    keys: &PageKeys,
    profile: CipherProfile,
    salt: &[u8; SALT_SIZE],
    iv: &[u8; IV_SIZE],
) -> Result<Vec<u8>> {
    let page_size = profile.page_size();
    check_page_len(plain, page_size)?;

    let data_start = data_start(page_index);
    let body_end = page_size - profile.reserve();
    let tag_start = body_end + IV_SIZE;

    let mut out = vec![0u8; page_size];
    if page_index == 0 {
        out[..SALT_SIZE].copy_from_slice(salt);
    }
    let body_len = body_end - data_start;
    out[data_start..body_end].copy_from_slice(&plain[data_start..body_end]);
    Aes256CbcEnc::new_from_slices(keys.enc_key(), iv)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?
        .encrypt_padded_mut::<NoPadding>(&mut out[data_start..body_end], body_len)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    out[body_end..tag_start].copy_from_slice(iv);

    let tag = compute_tag(keys, profile.digest(), &out[data_start..tag_start], page_index)?;
    out[tag_start..tag_start + tag.len()].copy_from_slice(&tag);
    Ok(out)
}

/// Check a raw key against the first page of a shard.
///
/// Derives the page keys from the salt embedded in `first_page` and verifies
/// the page 0 tag. Returns `false` for short or all-zero pages.
pub fn validate_key(first_page: &[u8], raw_key: &[u8; KEY_SIZE], profile: CipherProfile) -> bool {
    if first_page.len() < profile.page_size() {
        return false;
    }
    let page = &first_page[..profile.page_size()];
    if page.iter().all(|&b| b == 0) {
        return false;
    }
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&page[..SALT_SIZE]);
    let keys = derive_keys(raw_key, &salt, profile);
    let tag_start = profile.page_size() - profile.reserve() + IV_SIZE;
    let tag = &page[tag_start..tag_start + profile.hmac_size()];
    verify_tag(&keys, profile.digest(), &page[SALT_SIZE..tag_start], 0, tag).unwrap_or(false)
}

fn data_start(page_index: u64) -> usize {
    if page_index == 0 {
        SALT_SIZE
    } else {
        0
    }
}

fn check_page_len(buf: &[u8], page_size: usize) -> Result<()> {
    if buf.len() != page_size {
        return Err(CryptoError::InvalidPageSize {
            expected: page_size,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn page_mac<M: Mac + KeyInit>(mac_key: &[u8], covered: &[u8], page_index: u64) -> Result<M> {
    let mut mac = <M as Mac>::new_from_slice(mac_key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        actual: mac_key.len(),
    })?;
    mac.update(covered);
    mac.update(&page_number(page_index).to_le_bytes());
    Ok(mac)
}

fn page_number(page_index: u64) -> u32 {
    (page_index as u32).wrapping_add(1)
}

fn verify_tag(keys: &PageKeys, digest: HmacDigest, covered: &[u8], page_index: u64, tag: &[u8]) -> Result<bool> {
    let key = keys.mac_key();
    Ok(match digest {
        HmacDigest::Sha1 => page_mac::<Hmac<Sha1>>(key, covered, page_index)?.verify_slice(tag).is_ok(),
        HmacDigest::Sha512 => page_mac::<Hmac<Sha512>>(key, covered, page_index)?.verify_slice(tag).is_ok(),
    })
}

fn compute_tag(keys: &PageKeys, digest: HmacDigest, covered: &[u8], page_index: u64) -> Result<Vec<u8>> {
    let key = keys.mac_key();
    Ok(match digest {
        HmacDigest::Sha1 => page_mac::<Hmac<Sha1>>(key, covered, page_index)?.finalize().into_bytes().to_vec(),
        HmacDigest::Sha512 => page_mac::<Hmac<Sha512>>(key, covered, page_index)?
            .finalize()
            .into_bytes()
            .to_vec(),
    })
}
