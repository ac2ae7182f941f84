//! Test vector generator for the shard page codec.
//!
//! Generates `test_vectors.json` with key derivation, page encryption and
//! conversation hash vectors for every cipher profile.
//!
//! Usage:
//!   shardlog-testvec              # Generate test_vectors.json
//!   shardlog-testvec --verify     # Verify test vectors match expected values

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shardlog_crypto::hash::conversation_hash;
use shardlog_crypto::page::SQLITE_HEADER;
use shardlog_crypto::{decrypt_page, derive_keys, encrypt_page, CipherProfile, KEY_SIZE};

const VECTORS_PATH: &str = "tests/fixtures/test_vectors.json";

#[derive(Serialize, Deserialize)]
struct TestVectors {
    version: String,
    generated_by: String,
    vectors: BTreeMap<String, TestVector>,
}

#[derive(Serialize, Deserialize)]
struct TestVector {
    description: String,
    inputs: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
}

fn raw_key() -> [u8; KEY_SIZE] {
    std::array::from_fn(|i| i as u8)
}

fn salt() -> [u8; 16] {
    std::array::from_fn(|i| 0x40 + i as u8)
}

fn iv() -> [u8; 16] {
    std::array::from_fn(|i| 0xa0 + i as u8)
}

/// Deterministic plaintext page; page 0 carries the SQLite header.
fn plaintext(profile: CipherProfile, page_index: u64) -> Vec<u8> {
    let mut page: Vec<u8> = (0..profile.page_size()).map(|i| (i % 251) as u8).collect();
    if page_index == 0 {
        page[..16].copy_from_slice(SQLITE_HEADER);
    }
    page
}

fn slug(profile: CipherProfile) -> String {
    profile.name().replace('-', "_")
}

fn generate_kdf_vectors() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    for profile in CipherProfile::ALL {
        let keys = derive_keys(&raw_key(), &salt(), profile);
        vectors.insert(
            format!("kdf_{}", slug(profile)),
            TestVector {
                description: format!(
                    "{}: PBKDF2 {} rounds, MAC key over salt ^ 0x3a",
                    profile.name(),
                    profile.kdf_iterations()
                ),
                inputs: BTreeMap::from([
                    ("raw_key".to_string(), hex::encode(raw_key())),
                    ("salt".to_string(), hex::encode(salt())),
                ]),
                outputs: BTreeMap::from([
                    ("enc_key".to_string(), hex::encode(keys.enc_key())),
                    ("mac_key".to_string(), hex::encode(keys.mac_key())),
                ]),
            },
        );
    }

    vectors
}

fn generate_page_vectors() -> anyhow::Result<BTreeMap<String, TestVector>> {
    let mut vectors = BTreeMap::new();

    for profile in CipherProfile::ALL {
        let keys = derive_keys(&raw_key(), &salt(), profile);
        for page_index in [0u64, 1] {
            let plain = plaintext(profile, page_index);
            let raw = encrypt_page(&plain, page_index, &keys, profile, &salt(), &iv())
                .with_context(|| format!("encrypt {} page {page_index}", profile.name()))?;
            let decrypted = decrypt_page(&raw, page_index, &keys, profile)
                .with_context(|| format!("decrypt {} page {page_index}", profile.name()))?;
            let body_end = profile.page_size() - profile.reserve();
            anyhow::ensure!(
                decrypted[..body_end] == plain[..body_end],
                "{} page {page_index} does not round-trip",
                profile.name()
            );

            vectors.insert(
                format!("page_{}_{page_index}", slug(profile)),
                TestVector {
                    description: format!(
                        "{} page {page_index}: AES-256-CBC body, {}-byte reserve",
                        profile.name(),
                        profile.reserve()
                    ),
                    inputs: BTreeMap::from([
                        ("raw_key".to_string(), hex::encode(raw_key())),
                        ("salt".to_string(), hex::encode(salt())),
                        ("iv".to_string(), hex::encode(iv())),
                        ("page_index".to_string(), page_index.to_string()),
                        ("plaintext".to_string(), hex::encode(&plain)),
                    ]),
                    outputs: BTreeMap::from([("raw_page".to_string(), hex::encode(&raw))]),
                },
            );
        }
    }

    Ok(vectors)
}

fn generate_hash_vectors() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    for talker in ["alice", "wxid_example", "12345678@chatroom"] {
        let hash = conversation_hash(talker);
        vectors.insert(
            format!("conversation_hash_{}", talker.replace(['@', '_'], "")),
            TestVector {
                description: format!("MD5(\"{talker}\") table name"),
                inputs: BTreeMap::from([("talker".to_string(), talker.to_string())]),
                outputs: BTreeMap::from([("table".to_string(), hash.table_name())]),
            },
        );
    }

    vectors
}

fn generate_all_vectors() -> anyhow::Result<TestVectors> {
    let mut all_vectors = BTreeMap::new();

    all_vectors.extend(generate_kdf_vectors());
    all_vectors.extend(generate_page_vectors()?);
    all_vectors.extend(generate_hash_vectors());

    Ok(TestVectors {
        version: "1.0".to_string(),
        generated_by: "shardlog-testvec".to_string(),
        vectors: all_vectors,
    })
}

fn verify_vectors(vectors: &TestVectors) -> anyhow::Result<bool> {
    let regenerated = generate_all_vectors()?;
    let mut all_pass = true;

    for (name, expected) in &vectors.vectors {
        if let Some(actual) = regenerated.vectors.get(name) {
            if actual.outputs != expected.outputs {
                eprintln!("FAIL: {name}");
                all_pass = false;
            } else {
                eprintln!("PASS: {name}");
            }
        } else {
            eprintln!("MISSING: {name}");
            all_pass = false;
        }
    }

    Ok(all_pass)
}

fn write_vectors(vectors: &TestVectors) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(vectors)?;
    if let Some(parent) = Path::new(VECTORS_PATH).parent() {
        std::fs::create_dir_all(parent).context("create fixture dir")?;
    }
    std::fs::write(VECTORS_PATH, json).with_context(|| format!("write {VECTORS_PATH}"))?;
    eprintln!("Generated {} test vectors to {VECTORS_PATH}", vectors.vectors.len());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let verify = std::env::args().any(|a| a == "--verify");

    let vectors = match std::fs::read_to_string(VECTORS_PATH) {
        Ok(content) if verify => serde_json::from_str(&content).context("parse test vectors")?,
        _ => {
            if verify {
                eprintln!("No existing test vectors found at {VECTORS_PATH}. Generating...");
            }
            let vectors = generate_all_vectors()?;
            write_vectors(&vectors)?;
            vectors
        }
    };

    if verify_vectors(&vectors)? {
        eprintln!("All test vectors verified successfully.");
        Ok(())
    } else {
        anyhow::bail!("test vector verification failed")
    }
}
