//! Per-unit proof persistence: in-memory cache backed by JSON records
//!
//! Proofs live under `<location>/.baobun/proofs/<info_hash_hex>/<unit>.json`
//! so a restarted node can keep serving units it cannot regenerate proofs
//! for (incomplete files). Writes are atomic via temp-file rename; a broken
//! record skips that unit without poisoning the rest of the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::protocol::{Proof, ProofNode};
use super::{InfoHash, SwarmError};

const PROOF_FILE_VERSION: u32 = 1;

/// On-disk proof directory for one swarm.
pub struct ProofStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct ProofRecordFile {
    version: u32,
    unit_index: u64,
    proof: ProofRecord,
}

#[derive(Serialize, Deserialize)]
struct ProofRecord {
    leaf_start: u64,
    leaf_count: u64,
    nodes: Vec<ProofNodeRecord>,
}

#[derive(Serialize, Deserialize)]
struct ProofNodeRecord {
    hash: String,
    level: u8,
}

impl ProofStore {
    /// Creates a store rooted at the swarm's proof directory.
    pub fn new(location: &Path, info_hash: InfoHash) -> Self {
        Self {
            dir: location
                .join(".baobun")
                .join("proofs")
                .join(info_hash.to_string()),
        }
    }

    /// Loads every valid proof record, returning the proofs and the number
    /// of files that failed to load. Bad files are skipped, never fatal.
    pub fn load_all(&self) -> (HashMap<u64, Proof>, usize) {
        let mut loaded = HashMap::new();
        let mut failures = 0;

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (loaded, 0),
            Err(e) => {
                warn!("failed to read proof cache directory {}: {e}", self.dir.display());
                return (loaded, 0);
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match load_record(&path) {
                Ok((index, proof)) => {
                    loaded.insert(index, proof);
                }
                Err(e) => {
                    warn!("skipping proof record {}: {e}", path.display());
                    failures += 1;
                }
            }
        }

        (loaded, failures)
    }

    /// Writes one proof record atomically.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - directory creation, write, or rename failure
    pub fn save(&self, unit_index: u64, proof: &Proof) -> Result<(), SwarmError> {
        std::fs::create_dir_all(&self.dir)?;

        let record = ProofRecordFile {
            version: PROOF_FILE_VERSION,
            unit_index,
            proof: ProofRecord {
                leaf_start: proof.leaf_start,
                leaf_count: proof.leaf_count,
                nodes: proof
                    .nodes
                    .iter()
                    .map(|node| ProofNodeRecord {
                        hash: hex::encode(node.hash),
                        level: node.level,
                    })
                    .collect(),
            },
        };

        let mut data = serde_json::to_vec_pretty(&record).map_err(|e| SwarmError::Malformed {
            message: format!("failed to encode proof record: {e}"),
        })?;
        data.push(b'\n');

        let target = self.path_for_unit(unit_index);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;

        if let Err(rename_err) = std::fs::rename(&tmp, &target) {
            // Some platforms refuse to rename over an existing file
            let _ = std::fs::remove_file(&target);
            if let Err(retry_err) = std::fs::rename(&tmp, &target) {
                let _ = std::fs::remove_file(&tmp);
                warn!("failed to finalize proof record {}: {rename_err}", target.display());
                return Err(retry_err.into());
            }
        }

        Ok(())
    }

    fn path_for_unit(&self, unit_index: u64) -> PathBuf {
        self.dir.join(format!("{unit_index}.json"))
    }

    /// Returns the directory proofs are stored in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_record(path: &Path) -> Result<(u64, Proof), SwarmError> {
    let stem_index: u64 = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SwarmError::Malformed {
            message: "file name is not a unit index".to_string(),
        })?;

    let data = std::fs::read(path)?;
    let record: ProofRecordFile =
        serde_json::from_slice(&data).map_err(|e| SwarmError::Malformed {
            message: format!("invalid proof record JSON: {e}"),
        })?;

    if record.version != PROOF_FILE_VERSION {
        return Err(SwarmError::Malformed {
            message: format!("unsupported proof record version: {}", record.version),
        });
    }
    if record.unit_index != stem_index {
        return Err(SwarmError::Malformed {
            message: format!(
                "unit index mismatch: file says {stem_index}, record says {}",
                record.unit_index
            ),
        });
    }

    let mut nodes = Vec::with_capacity(record.proof.nodes.len());
    for node in &record.proof.nodes {
        let decoded = hex::decode(&node.hash).map_err(|e| SwarmError::Malformed {
            message: format!("invalid proof node hash hex: {e}"),
        })?;
        let hash: [u8; 32] = decoded.try_into().map_err(|_| SwarmError::Malformed {
            message: "proof node hash is not 32 bytes".to_string(),
        })?;
        nodes.push(ProofNode {
            hash,
            level: node.level,
        });
    }

    Ok((
        stem_index,
        Proof {
            leaf_start: record.proof.leaf_start,
            leaf_count: record.proof.leaf_count,
            nodes,
        },
    ))
}

/// In-memory proof cache for one swarm, persisting through a [`ProofStore`].
///
/// Lookups hand out clones so serving paths can never mutate cached state.
/// Entries are kept for the lifetime of the swarm; nothing evicts them.
pub struct ProofCache {
    entries: RwLock<HashMap<u64, Proof>>,
    store: ProofStore,
}

impl ProofCache {
    /// Creates an empty cache persisting under the swarm's proof directory.
    pub fn new(location: &Path, info_hash: InfoHash) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store: ProofStore::new(location, info_hash),
        }
    }

    /// Loads all proofs from disk into memory, returning how many loaded
    /// and how many files were skipped.
    pub fn load_from_disk(&self) -> (usize, usize) {
        let (loaded, failures) = self.store.load_all();
        let count = loaded.len();
        let mut entries = self.entries.write().expect("proof cache lock poisoned");
        entries.extend(loaded);
        (count, failures)
    }

    /// Returns a clone of the cached proof for `unit_index`, if any.
    pub fn get(&self, unit_index: u64) -> Option<Proof> {
        self.entries
            .read()
            .expect("proof cache lock poisoned")
            .get(&unit_index)
            .cloned()
    }

    /// Returns whether a proof for `unit_index` is cached.
    pub fn has(&self, unit_index: u64) -> bool {
        self.entries
            .read()
            .expect("proof cache lock poisoned")
            .contains_key(&unit_index)
    }

    /// Caches a proof and persists it.
    ///
    /// The in-memory entry sticks even when the disk write fails; the error
    /// is surfaced so callers can log it.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - persisting the record failed
    pub fn save(&self, unit_index: u64, proof: &Proof) -> Result<(), SwarmError> {
        self.entries
            .write()
            .expect("proof cache lock poisoned")
            .insert(unit_index, proof.clone());

        self.store.save(unit_index, proof)
    }

    /// Returns the on-disk directory backing this cache.
    pub fn dir(&self) -> &Path {
        self.store.dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof() -> Proof {
        Proof {
            leaf_start: 256,
            leaf_count: 64,
            nodes: vec![
                ProofNode {
                    hash: [0xAB; 32],
                    level: 3,
                },
                ProofNode {
                    hash: [0x01; 32],
                    level: 0,
                },
            ],
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = InfoHash::new([9u8; 32]);

        let store = ProofStore::new(dir.path(), info_hash);
        let proof = sample_proof();
        store.save(4, &proof).unwrap();
        store.save(7, &proof).unwrap();

        let (loaded, failures) = ProofStore::new(dir.path(), info_hash).load_all();
        assert_eq!(failures, 0);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&4], proof);
        assert_eq!(loaded[&7], proof);
    }

    #[test]
    fn test_corrupted_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = InfoHash::new([9u8; 32]);

        let store = ProofStore::new(dir.path(), info_hash);
        store.save(1, &sample_proof()).unwrap();

        std::fs::write(store.dir().join("2.json"), b"{ not json").unwrap();
        std::fs::write(store.dir().join("not-a-number.json"), b"{}").unwrap();
        // A version we do not understand
        std::fs::write(
            store.dir().join("3.json"),
            br#"{"version":9,"unit_index":3,"proof":{"leaf_start":0,"leaf_count":1,"nodes":[]}}"#,
        )
        .unwrap();
        // Index mismatch between file name and record
        std::fs::write(
            store.dir().join("5.json"),
            br#"{"version":1,"unit_index":6,"proof":{"leaf_start":0,"leaf_count":1,"nodes":[]}}"#,
        )
        .unwrap();

        let (loaded, failures) = store.load_all();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&1));
        assert_eq!(failures, 4);
    }

    #[test]
    fn test_save_overwrites_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = InfoHash::new([9u8; 32]);
        let store = ProofStore::new(dir.path(), info_hash);

        store.save(0, &sample_proof()).unwrap();
        let mut updated = sample_proof();
        updated.nodes.pop();
        store.save(0, &updated).unwrap();

        let (loaded, _) = store.load_all();
        assert_eq!(loaded[&0], updated);
    }

    #[test]
    fn test_cache_returns_clones() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProofCache::new(dir.path(), InfoHash::new([2u8; 32]));

        cache.save(0, &sample_proof()).unwrap();
        let mut fetched = cache.get(0).unwrap();
        fetched.nodes[0].hash[0] = 0xFF;

        // Cached state is unaffected by mutation of the returned proof
        assert_eq!(cache.get(0).unwrap(), sample_proof());
        assert!(cache.has(0));
        assert!(!cache.has(1));
    }

    #[test]
    fn test_cache_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = InfoHash::new([2u8; 32]);

        {
            let cache = ProofCache::new(dir.path(), info_hash);
            cache.save(11, &sample_proof()).unwrap();
        }

        let cache = ProofCache::new(dir.path(), info_hash);
        assert!(!cache.has(11));
        let (count, failures) = cache.load_from_disk();
        assert_eq!((count, failures), (1, 0));
        assert_eq!(cache.get(11).unwrap(), sample_proof());
    }

    #[test]
    fn test_directory_path_uses_info_hash_hex() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = InfoHash::new([0xA5u8; 32]);
        let store = ProofStore::new(dir.path(), info_hash);
        let expected = dir
            .path()
            .join(".baobun")
            .join("proofs")
            .join(info_hash.to_string());
        assert_eq!(store.dir(), expected);
    }
}
