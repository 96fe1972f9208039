//! Swarm descriptors (".bao" files) and canonical info hashing

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::merkle;
use super::{InfoHash, SwarmError, UNIT_SIZE};

/// Immutable identity of a single file shared through a swarm.
///
/// Carries the file name, its exact length, the BLAKE3 Merkle root over its
/// 1 KiB leaves, and the trackers announcing the swarm. The info hash is a
/// pure function of this content and is recomputed on every load; whatever
/// a `.bao` file claims on disk is discarded.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// File name, also used as the on-disk name inside the swarm location
    pub name: String,
    /// Exact file length in bytes
    pub length: u64,
    /// Merkle root as lowercase hex
    pub root_hash: String,
    /// Tracker addresses; order is irrelevant to identity
    pub trackers: Vec<String>,
    root: [u8; 32],
    info_hash: InfoHash,
}

/// On-disk JSON form. The stored info hash exists only for humans.
#[derive(Serialize, Deserialize)]
struct DescriptorFile {
    name: String,
    length: u64,
    root_hash: String,
    #[serde(default)]
    info_hash: Option<String>,
    trackers: Vec<String>,
}

/// Canonical serialization input: fixed field order, sorted trackers.
#[derive(Serialize)]
struct CanonicalDescriptor<'a> {
    name: &'a str,
    length: u64,
    root_hash: &'a str,
    trackers: Vec<&'a str>,
}

impl Descriptor {
    /// Builds a descriptor from its parts, validating structure and
    /// computing the canonical info hash.
    ///
    /// # Errors
    ///
    /// - `SwarmError::DescriptorInvalid` - empty name or malformed root hash
    pub fn new(
        name: String,
        length: u64,
        root_hash: String,
        trackers: Vec<String>,
    ) -> Result<Self, SwarmError> {
        if name.is_empty() {
            return Err(SwarmError::DescriptorInvalid {
                reason: "empty file name".to_string(),
            });
        }

        let root = decode_root_hash(&root_hash)?;

        let mut descriptor = Self {
            name,
            length,
            root_hash,
            trackers,
            root,
            info_hash: InfoHash::new([0u8; 32]),
        };
        descriptor.info_hash = descriptor.compute_info_hash();
        Ok(descriptor)
    }

    /// Hashes a local file and builds a descriptor for it.
    ///
    /// # Errors
    ///
    /// - `SwarmError::DescriptorInvalid` - path has no file name
    /// - `SwarmError::Io` - file cannot be opened or read
    pub fn create_from_file(path: &Path, trackers: Vec<String>) -> Result<Self, SwarmError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SwarmError::DescriptorInvalid {
                reason: format!("path has no usable file name: {}", path.display()),
            })?
            .to_string();

        let file = fs::File::open(path)?;
        let length = file.metadata()?.len();
        let root = merkle::compute_root(&file, length)?;

        Self::new(name, length, hex::encode(root), trackers)
    }

    /// Loads a descriptor from a `.bao` file, recomputing the info hash.
    ///
    /// # Errors
    ///
    /// - `SwarmError::DescriptorInvalid` - JSON or structural failure
    /// - `SwarmError::Io` - file cannot be read
    pub fn load(path: &Path) -> Result<Self, SwarmError> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Loads a descriptor from raw `.bao` JSON bytes.
    ///
    /// # Errors
    ///
    /// - `SwarmError::DescriptorInvalid` - JSON or structural failure
    pub fn from_bytes(data: &[u8]) -> Result<Self, SwarmError> {
        let file: DescriptorFile =
            serde_json::from_slice(data).map_err(|e| SwarmError::DescriptorInvalid {
                reason: format!("failed to decode descriptor JSON: {e}"),
            })?;

        // file.info_hash is deliberately discarded
        Self::new(file.name, file.length, file.root_hash, file.trackers)
    }

    /// Writes the descriptor as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - file cannot be written
    pub fn save(&self, path: &Path) -> Result<(), SwarmError> {
        let file = DescriptorFile {
            name: self.name.clone(),
            length: self.length,
            root_hash: self.root_hash.clone(),
            info_hash: Some(self.info_hash.to_string()),
            trackers: self.trackers.clone(),
        };
        let mut data = serde_json::to_vec_pretty(&file).map_err(|e| {
            SwarmError::DescriptorInvalid {
                reason: format!("failed to encode descriptor JSON: {e}"),
            }
        })?;
        data.push(b'\n');
        fs::write(path, data)?;
        Ok(())
    }

    fn compute_info_hash(&self) -> InfoHash {
        let mut trackers: Vec<&str> = self.trackers.iter().map(String::as_str).collect();
        trackers.sort_unstable();

        let canonical = CanonicalDescriptor {
            name: &self.name,
            length: self.length,
            root_hash: &self.root_hash,
            trackers,
        };
        let data = serde_json::to_vec(&canonical).expect("canonical form always serializes");
        InfoHash::new(blake3::hash(&data).into())
    }

    /// Returns the canonical info hash of this descriptor.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Returns the decoded 32-byte Merkle root.
    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    /// Returns the number of transfer units.
    pub fn unit_count(&self) -> u64 {
        self.length.div_ceil(UNIT_SIZE)
    }

    /// Returns the byte size of unit `index`; the last unit may be short.
    ///
    /// # Errors
    ///
    /// - `SwarmError::OutOfBounds` - index past the last unit
    pub fn unit_size(&self, index: u64) -> Result<u64, SwarmError> {
        if index >= self.unit_count() {
            return Err(SwarmError::OutOfBounds {
                offset: index * UNIT_SIZE,
                length: UNIT_SIZE,
            });
        }

        let start = index * UNIT_SIZE;
        Ok(UNIT_SIZE.min(self.length - start))
    }

    /// Returns whether two descriptors reference the same file content.
    pub fn same_content(&self, other: &Descriptor) -> bool {
        self.root_hash == other.root_hash && self.length == other.length
    }
}

fn decode_root_hash(root_hash: &str) -> Result<[u8; 32], SwarmError> {
    if root_hash.len() != 64 || !root_hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(SwarmError::DescriptorInvalid {
            reason: "root hash must be 64 lowercase hex characters".to_string(),
        });
    }

    let decoded = hex::decode(root_hash).map_err(|e| SwarmError::DescriptorInvalid {
        reason: format!("root hash is not valid hex: {e}"),
    })?;

    let mut root = [0u8; 32];
    root.copy_from_slice(&decoded);
    Ok(root)
}
