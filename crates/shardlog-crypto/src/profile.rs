//! Cipher profiles.
//!
//! Each platform/version pair fixes the page size, the PBKDF2 iteration
//! count and the HMAC digest. The reserved trailer at the end of every page
//! holds the IV followed by the tag, rounded up to the AES block size.

use shardlog_types::Platform;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// IV size in bytes.
pub const IV_SIZE: usize = 16;

/// Digest used for both PBKDF2 and the page HMAC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HmacDigest {
    Sha1,
    Sha512,
}

impl HmacDigest {
    /// Tag length in bytes.
    pub const fn size(&self) -> usize {
        match self {
            HmacDigest::Sha1 => 20,
            HmacDigest::Sha512 => 64,
        }
    }
}

/// Closed set of supported on-disk formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherProfile {
    WindowsV3,
    WindowsV4,
    MacosV3,
    MacosV4,
}

impl CipherProfile {
    pub const ALL: [CipherProfile; 4] = [
        CipherProfile::WindowsV4,
        CipherProfile::MacosV4,
        CipherProfile::WindowsV3,
        CipherProfile::MacosV3,
    ];

    /// Profile for a platform and major version.
    ///
    /// Unknown versions fall back to the Windows v4 profile.
    pub fn resolve(platform: Platform, version: u32) -> Self {
        match (platform, version) {
            (Platform::Windows, 4) => CipherProfile::WindowsV4,
            (Platform::Macos, 4) => CipherProfile::MacosV4,
            (Platform::Windows, 3) => CipherProfile::WindowsV3,
            (Platform::Macos, 3) => CipherProfile::MacosV3,
            _ => {
                tracing::warn!(%platform, version, "unknown cipher profile, using windows v4");
                CipherProfile::WindowsV4
            }
        }
    }

    /// Like [`CipherProfile::resolve`] but accepts a free-form platform name.
    pub fn resolve_named(platform: &str, version: u32) -> Self {
        match platform.parse::<Platform>() {
            Ok(platform) => Self::resolve(platform, version),
            Err(_) => {
                tracing::warn!(platform, version, "unknown platform, using windows v4");
                CipherProfile::WindowsV4
            }
        }
    }

    pub const fn platform(&self) -> Platform {
        match self {
            CipherProfile::WindowsV3 | CipherProfile::WindowsV4 => Platform::Windows,
            CipherProfile::MacosV3 | CipherProfile::MacosV4 => Platform::Macos,
        }
    }

    pub const fn version(&self) -> u32 {
        match self {
            CipherProfile::WindowsV3 | CipherProfile::MacosV3 => 3,
            CipherProfile::WindowsV4 | CipherProfile::MacosV4 => 4,
        }
    }

    pub const fn page_size(&self) -> usize {
        match self {
            CipherProfile::MacosV3 => 1024,
            _ => 4096,
        }
    }

    /// PBKDF2 rounds for the encryption key; 0 means the raw key is used as is.
    pub const fn kdf_iterations(&self) -> u32 {
        match self {
            CipherProfile::WindowsV4 | CipherProfile::MacosV4 => 256_000,
            CipherProfile::WindowsV3 => 64_000,
            CipherProfile::MacosV3 => 0,
        }
    }

    pub const fn digest(&self) -> HmacDigest {
        match self {
            CipherProfile::WindowsV4 | CipherProfile::MacosV4 => HmacDigest::Sha512,
            CipherProfile::WindowsV3 | CipherProfile::MacosV3 => HmacDigest::Sha1,
        }
    }

    pub const fn hmac_size(&self) -> usize {
        self.digest().size()
    }

    /// Reserved bytes at the end of every page.
    pub const fn reserve(&self) -> usize {
        let raw = IV_SIZE + self.hmac_size();
        raw.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
    }

    /// Short name such as `windows-v4`.
    pub fn name(&self) -> String {
        format!("{}-v{}", self.platform(), self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_table() {
        let expected = [
            (CipherProfile::WindowsV4, 4096, 256_000, 64, 80),
            (CipherProfile::MacosV4, 4096, 256_000, 64, 80),
            (CipherProfile::WindowsV3, 4096, 64_000, 20, 48),
            (CipherProfile::MacosV3, 1024, 0, 20, 48),
        ];
        for (profile, page, iters, hmac, reserve) in expected {
            assert_eq!(profile.page_size(), page, "{profile:?}");
            assert_eq!(profile.kdf_iterations(), iters, "{profile:?}");
            assert_eq!(profile.hmac_size(), hmac, "{profile:?}");
            assert_eq!(profile.reserve(), reserve, "{profile:?}");
        }
    }

    #[test]
    fn test_resolve() {
        assert_eq!(CipherProfile::resolve(Platform::Macos, 3), CipherProfile::MacosV3);
        assert_eq!(CipherProfile::resolve(Platform::Windows, 3), CipherProfile::WindowsV3);
        assert_eq!(CipherProfile::resolve_named("darwin", 4), CipherProfile::MacosV4);
    }

    #[test]
    fn test_unknown_falls_back_to_windows_v4() {
        assert_eq!(CipherProfile::resolve(Platform::Macos, 5), CipherProfile::WindowsV4);
        assert_eq!(CipherProfile::resolve_named("linux", 3), CipherProfile::WindowsV4);
    }

    #[test]
    fn test_ciphertext_is_block_aligned() {
        for profile in CipherProfile::ALL {
            let body = profile.page_size() - profile.reserve();
            assert_eq!(body % AES_BLOCK_SIZE, 0);
            assert_eq!((body - 16) % AES_BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn test_name() {
        assert_eq!(CipherProfile::MacosV3.name(), "macos-v3");
    }
}
