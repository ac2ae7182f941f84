//! Page key derivation.
//!
//! The encryption key is PBKDF2 over the raw 32-byte key and the file salt
//! (or the raw key itself when the profile has no KDF rounds). The MAC key
//! is PBKDF2 over the encryption key with the salt XORed with `0x3a`, two
//! rounds.

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::profile::{CipherProfile, HmacDigest};
use crate::{CryptoError, Result};

/// Raw and derived key size (AES-256).
pub const KEY_SIZE: usize = 32;

/// Salt size at the start of every shard file.
pub const SALT_SIZE: usize = 16;

const MAC_SALT_MASK: u8 = 0x3a;
const MAC_KDF_ROUNDS: u32 = 2;

/// Derived keys for one file. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PageKeys {
    enc_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl PageKeys {
    /// Build from already derived keys.
    pub fn from_parts(enc_key: [u8; KEY_SIZE], mac_key: [u8; KEY_SIZE]) -> Self {
        Self { enc_key, mac_key }
    }

    pub fn enc_key(&self) -> &[u8; KEY_SIZE] {
        &self.enc_key
    }

    pub fn mac_key(&self) -> &[u8; KEY_SIZE] {
        &self.mac_key
    }
}

impl std::fmt::Debug for PageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PageKeys(..)")
    }
}

/// Derive the page keys for a file from its raw key and salt.
pub fn derive_keys(raw_key: &[u8; KEY_SIZE], salt: &[u8; SALT_SIZE], profile: CipherProfile) -> PageKeys {
    let digest = profile.digest();
    let mut enc_key = [0u8; KEY_SIZE];
    match profile.kdf_iterations() {
        0 => enc_key.copy_from_slice(raw_key),
        rounds => pbkdf2(digest, raw_key, salt, rounds, &mut enc_key),
    }

    let mut mac_salt = *salt;
    for byte in mac_salt.iter_mut() {
        *byte ^= MAC_SALT_MASK;
    }
    let mut mac_key = [0u8; KEY_SIZE];
    pbkdf2(digest, &enc_key, &mac_salt, MAC_KDF_ROUNDS, &mut mac_key);

    let keys = PageKeys::from_parts(enc_key, mac_key);
    enc_key.zeroize();
    mac_key.zeroize();
    keys
}

fn pbkdf2(digest: HmacDigest, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
    match digest {
        HmacDigest::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, rounds, out),
        HmacDigest::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, rounds, out),
    }
}

/// Decode a 64-character hex key.
pub fn parse_hex_key(hex_key: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidInput(format!("key is not hex: {e}")))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        });
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: [u8; KEY_SIZE] = [0x11; KEY_SIZE];
    const SALT: [u8; SALT_SIZE] = [0x22; SALT_SIZE];

    #[test]
    fn test_macos_v3_uses_raw_key() {
        let keys = derive_keys(&RAW, &SALT, CipherProfile::MacosV3);
        assert_eq!(keys.enc_key(), &RAW);
        assert_ne!(keys.mac_key(), &RAW);
    }

    #[test]
    fn test_mac_key_derivation() {
        let keys = derive_keys(&RAW, &SALT, CipherProfile::MacosV3);
        let mut mac_salt = SALT;
        mac_salt.iter_mut().for_each(|b| *b ^= 0x3a);
        let mut expected = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha1>(&RAW, &mac_salt, 2, &mut expected);
        assert_eq!(keys.mac_key(), &expected);
    }

    #[test]
    fn test_windows_v3_runs_kdf() {
        let keys = derive_keys(&RAW, &SALT, CipherProfile::WindowsV3);
        let mut expected = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha1>(&RAW, &SALT, 64_000, &mut expected);
        assert_eq!(keys.enc_key(), &expected);
    }

    #[test]
    fn test_salt_changes_keys() {
        let a = derive_keys(&RAW, &SALT, CipherProfile::MacosV3);
        let b = derive_keys(&RAW, &[0x23; SALT_SIZE], CipherProfile::MacosV3);
        assert_ne!(a.mac_key(), b.mac_key());
    }

    #[test]
    fn test_parse_hex_key() {
        let key = parse_hex_key(&"ab".repeat(32)).expect("parse");
        assert_eq!(*key, [0xab; KEY_SIZE]);
        assert!(matches!(
            parse_hex_key("abcd"),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 2 })
        ));
        assert!(matches!(parse_hex_key("zz"), Err(CryptoError::InvalidInput(_))));
    }

    #[test]
    fn test_debug_hides_keys() {
        let keys = PageKeys::from_parts([1; KEY_SIZE], [2; KEY_SIZE]);
        assert_eq!(format!("{keys:?}"), "PageKeys(..)");
    }
}
