//! BLAKE3 Merkle tree over 1 KiB leaves: root compute, proof generation,
//! proof verification
//!
//! The tree is a complete binary tree over the file's 1 KiB leaves, padded
//! to the next power of two. Leaf hash is BLAKE3-256 of the leaf content;
//! padding leaves hash the all-zero leaf. Parent hash is BLAKE3-256 of the
//! two child hashes concatenated. A proof for a contiguous leaf range is
//! the list of sibling subtree roots met while walking the padded tree and
//! stopping wherever a subtree is disjoint from the range, each tagged with
//! its tree level so the verifier can detect malformed node sequences.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::OnceLock;

use super::SwarmError;
use super::protocol::{Proof, ProofNode};

/// Merkle leaf size in bytes.
pub const LEAF_SIZE: u64 = 1024;

fn hash_leaf(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

fn hash_parent(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hash of the all-zero leaf, used for every padding leaf.
fn zero_leaf_hash() -> [u8; 32] {
    static ZERO: OnceLock<[u8; 32]> = OnceLock::new();
    *ZERO.get_or_init(|| hash_leaf(&[0u8; LEAF_SIZE as usize]))
}

/// Number of real leaves in a file of `file_len` bytes.
fn leaf_count(file_len: u64) -> u64 {
    file_len.div_ceil(LEAF_SIZE)
}

/// Padded leaf count: next power of two, at least one leaf.
fn padded_leaves(file_len: u64) -> u64 {
    leaf_count(file_len).max(1).next_power_of_two()
}

/// Tree height above the leaves for a padded leaf count.
fn tree_height(tree_leaves: u64) -> u8 {
    tree_leaves.trailing_zeros() as u8
}

/// Reads at `offset` until `buf` is full or EOF; the tail stays untouched.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Hashes leaf `leaf` of the file, zero-padding a short tail read.
fn read_leaf_hash(file: &File, leaf: u64) -> Result<[u8; 32], SwarmError> {
    let mut buf = [0u8; LEAF_SIZE as usize];
    read_full_at(file, &mut buf, leaf * LEAF_SIZE)?;
    Ok(hash_leaf(&buf))
}

/// Hashes the full subtree rooted at `(start, size)` leaves.
fn hash_subtree(
    file: &File,
    start: u64,
    size: u64,
    total_leaves: u64,
) -> Result<[u8; 32], SwarmError> {
    if size == 1 {
        if start >= total_leaves {
            return Ok(zero_leaf_hash());
        }
        return read_leaf_hash(file, start);
    }

    let half = size / 2;
    let left = hash_subtree(file, start, half, total_leaves)?;
    let right = hash_subtree(file, start + half, half, total_leaves)?;
    Ok(hash_parent(&left, &right))
}

/// Computes the Merkle root of a file on disk.
pub fn compute_root(file: &File, file_len: u64) -> Result<[u8; 32], SwarmError> {
    let total_leaves = leaf_count(file_len);
    let tree_leaves = padded_leaves(file_len);
    hash_subtree(file, 0, tree_leaves, total_leaves)
}

struct ProofWalk<'a> {
    file: &'a File,
    leaf_start: u64,
    leaf_end: u64,
    total_leaves: u64,
    nodes: Vec<ProofNode>,
}

impl ProofWalk<'_> {
    fn walk(&mut self, start: u64, size: u64, level: u8) -> Result<[u8; 32], SwarmError> {
        // Subtree disjoint from the range: compress to one tagged hash
        if start + size <= self.leaf_start || start >= self.leaf_end {
            let hash = hash_subtree(self.file, start, size, self.total_leaves)?;
            self.nodes.push(ProofNode { hash, level });
            return Ok(hash);
        }

        if size == 1 {
            // Leaf inside the range; the verifier rebuilds it from the segment
            if start >= self.total_leaves {
                return Ok(zero_leaf_hash());
            }
            return read_leaf_hash(self.file, start);
        }

        let half = size / 2;
        let left = self.walk(start, half, level - 1)?;
        let right = self.walk(start + half, half, level - 1)?;
        Ok(hash_parent(&left, &right))
    }
}

/// Generates an inclusion proof for the byte range `[offset, offset+length)`
/// and returns it together with the recomputed root.
///
/// Callers serving data must compare the returned root against the
/// descriptor's root before sending; a mismatch means the local file no
/// longer matches the swarm.
///
/// # Errors
///
/// - `SwarmError::OutOfBounds` - zero-length range
/// - `SwarmError::Io` - file read failure
pub fn generate_proof(
    file: &File,
    file_len: u64,
    offset: u64,
    length: u64,
) -> Result<(Proof, [u8; 32]), SwarmError> {
    if length == 0 {
        return Err(SwarmError::OutOfBounds { offset, length });
    }

    let leaf_start = offset / LEAF_SIZE;
    let leaf_end = (offset + length).div_ceil(LEAF_SIZE);

    let total_leaves = leaf_count(file_len);
    let tree_leaves = padded_leaves(file_len);

    let mut walk = ProofWalk {
        file,
        leaf_start,
        leaf_end,
        total_leaves,
        nodes: Vec::new(),
    };
    let root = walk.walk(0, tree_leaves, tree_height(tree_leaves))?;

    Ok((
        Proof {
            leaf_start,
            leaf_count: leaf_end - leaf_start,
            nodes: walk.nodes,
        },
        root,
    ))
}

struct VerifyWalk<'a> {
    seg_start: u64,
    seg_end: u64,
    leaf_hashes: &'a [[u8; 32]],
    nodes: &'a [ProofNode],
    next_node: usize,
}

impl VerifyWalk<'_> {
    fn walk(&mut self, start: u64, size: u64, level: u8) -> Result<[u8; 32], SwarmError> {
        // Disjoint subtree: its root must be the next proof node
        if start + size <= self.seg_start || start >= self.seg_end {
            let Some(node) = self.nodes.get(self.next_node) else {
                return Err(SwarmError::BadProof {
                    reason: format!("missing proof node at level {level}"),
                });
            };
            if node.level != level {
                return Err(SwarmError::BadProof {
                    reason: format!(
                        "proof node level mismatch at index {}: got {}, expected {level}",
                        self.next_node, node.level
                    ),
                });
            }
            self.next_node += 1;
            return Ok(node.hash);
        }

        if size == 1 {
            let idx = start - self.seg_start;
            let Some(hash) = self.leaf_hashes.get(idx as usize) else {
                return Err(SwarmError::BadProof {
                    reason: format!("leaf index out of range: {idx}"),
                });
            };
            return Ok(*hash);
        }

        let half = size / 2;
        let left = self.walk(start, half, level - 1)?;
        let right = self.walk(start + half, half, level - 1)?;
        Ok(hash_parent(&left, &right))
    }
}

/// Verifies a segment against an inclusion proof and the expected root.
///
/// The segment must cover exactly `proof.leaf_count` leaves starting at
/// `proof.leaf_start`; a short final leaf is zero-padded before hashing.
///
/// # Errors
///
/// - `SwarmError::BadProof` - empty proof, segment/leaf-count mismatch,
///   level mismatch, missing or unconsumed proof nodes, or root mismatch
pub fn verify_proof(
    segment: &[u8],
    proof: &Proof,
    expected_root: &[u8; 32],
    file_len: u64,
) -> Result<(), SwarmError> {
    if proof.leaf_count == 0 {
        return Err(SwarmError::BadProof {
            reason: "empty proof".to_string(),
        });
    }

    if (segment.len() as u64).div_ceil(LEAF_SIZE) != proof.leaf_count {
        return Err(SwarmError::BadProof {
            reason: format!(
                "segment of {} bytes does not cover {} leaves",
                segment.len(),
                proof.leaf_count
            ),
        });
    }

    let mut leaf_hashes = Vec::with_capacity(proof.leaf_count as usize);
    for chunk in segment.chunks(LEAF_SIZE as usize) {
        if chunk.len() == LEAF_SIZE as usize {
            leaf_hashes.push(hash_leaf(chunk));
        } else {
            let mut padded = [0u8; LEAF_SIZE as usize];
            padded[..chunk.len()].copy_from_slice(chunk);
            leaf_hashes.push(hash_leaf(&padded));
        }
    }

    let tree_leaves = padded_leaves(file_len);

    let Some(seg_end) = proof.leaf_start.checked_add(proof.leaf_count) else {
        return Err(SwarmError::BadProof {
            reason: "leaf range overflows".to_string(),
        });
    };

    let mut walk = VerifyWalk {
        seg_start: proof.leaf_start,
        seg_end,
        leaf_hashes: &leaf_hashes,
        nodes: &proof.nodes,
        next_node: 0,
    };
    let root = walk.walk(0, tree_leaves, tree_height(tree_leaves))?;

    if walk.next_node != proof.nodes.len() {
        return Err(SwarmError::BadProof {
            reason: format!(
                "{} unconsumed proof nodes",
                proof.nodes.len() - walk.next_node
            ),
        });
    }

    if root != *expected_root {
        return Err(SwarmError::BadProof {
            reason: format!(
                "root mismatch: got {}, expected {}",
                hex::encode(&root[..4]),
                hex::encode(&expected_root[..4])
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::swarm::UNIT_SIZE;

    fn temp_file_with(data: &[u8]) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(data).expect("write test data");
        tmp.flush().expect("flush");
        tmp
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_root_deterministic_across_opens() {
        let data = patterned(10 * 1024);
        let tmp = temp_file_with(&data);

        let first = {
            let file = File::open(tmp.path()).unwrap();
            compute_root(&file, data.len() as u64).unwrap()
        };
        let second = {
            let file = File::open(tmp.path()).unwrap();
            compute_root(&file, data.len() as u64).unwrap()
        };
        assert_eq!(first, second);
        assert_ne!(first, [0u8; 32]);
    }

    #[test]
    fn test_proof_round_trip_all_units() {
        for file_len in [1024u64, 64 * 1024, 128 * 1024, 500 * 1024] {
            let data = patterned(file_len as usize);
            let tmp = temp_file_with(&data);
            let file = File::open(tmp.path()).unwrap();

            let root = compute_root(&file, file_len).unwrap();

            let unit_count = file_len.div_ceil(UNIT_SIZE);
            for unit in 0..unit_count {
                let offset = unit * UNIT_SIZE;
                let length = UNIT_SIZE.min(file_len - offset);

                let (proof, generated_root) =
                    generate_proof(&file, file_len, offset, length).unwrap();
                assert_eq!(generated_root, root, "unit {unit} of {file_len} bytes");

                let segment = &data[offset as usize..(offset + length) as usize];
                verify_proof(segment, &proof, &root, file_len)
                    .unwrap_or_else(|e| panic!("unit {unit} of {file_len} bytes: {e}"));
            }
        }
    }

    #[test]
    fn test_middle_unit_of_500k_file() {
        // 500 KiB patterned file, unit 4 covering bytes [262144, 327680)
        let file_len = 500 * 1024u64;
        let data = patterned(file_len as usize);
        let tmp = temp_file_with(&data);
        let file = File::open(tmp.path()).unwrap();

        let root = compute_root(&file, file_len).unwrap();
        let (proof, generated_root) = generate_proof(&file, file_len, 262_144, 65_536).unwrap();
        assert_eq!(generated_root, root);

        let mut segment = data[262_144..262_144 + 65_536].to_vec();
        verify_proof(&segment, &proof, &root, file_len).unwrap();

        // One flipped data bit must be rejected
        segment[0] ^= 0x01;
        let err = verify_proof(&segment, &proof, &root, file_len).unwrap_err();
        assert!(matches!(err, SwarmError::BadProof { .. }));
    }

    #[test]
    fn test_single_unit_file_proof_has_no_nodes() {
        // Exactly one unit: 64 leaves padded to 64, range covers the tree
        let file_len = 64 * 1024u64;
        let data = patterned(file_len as usize);
        let tmp = temp_file_with(&data);
        let file = File::open(tmp.path()).unwrap();

        let root = compute_root(&file, file_len).unwrap();
        let (proof, _) = generate_proof(&file, file_len, 0, file_len).unwrap();
        assert_eq!(proof.leaf_start, 0);
        assert_eq!(proof.leaf_count, 64);
        assert!(proof.nodes.is_empty());

        verify_proof(&data, &proof, &root, file_len).unwrap();
    }

    #[test]
    fn test_single_leaf_file() {
        let file_len = 1024u64;
        let data = patterned(file_len as usize);
        let tmp = temp_file_with(&data);
        let file = File::open(tmp.path()).unwrap();

        let root = compute_root(&file, file_len).unwrap();
        let (proof, _) = generate_proof(&file, file_len, 0, file_len).unwrap();
        assert_eq!(proof.leaf_count, 1);
        assert!(proof.nodes.is_empty());

        verify_proof(&data, &proof, &root, file_len).unwrap();
    }

    #[test]
    fn test_tampered_proofs_rejected() {
        let file_len = 500 * 1024u64;
        let data = patterned(file_len as usize);
        let tmp = temp_file_with(&data);
        let file = File::open(tmp.path()).unwrap();

        let root = compute_root(&file, file_len).unwrap();
        let (proof, _) = generate_proof(&file, file_len, 65_536, 65_536).unwrap();
        let segment = &data[65_536..131_072];
        assert!(!proof.nodes.is_empty());
        verify_proof(segment, &proof, &root, file_len).unwrap();

        // Flip one bit of one node hash
        let mut bad = proof.clone();
        bad.nodes[0].hash[0] ^= 0x80;
        assert!(matches!(
            verify_proof(segment, &bad, &root, file_len),
            Err(SwarmError::BadProof { .. })
        ));

        // Shift one node level
        let mut bad = proof.clone();
        bad.nodes[0].level += 1;
        assert!(matches!(
            verify_proof(segment, &bad, &root, file_len),
            Err(SwarmError::BadProof { .. })
        ));

        // Truncate the node list
        let mut bad = proof.clone();
        bad.nodes.pop();
        assert!(matches!(
            verify_proof(segment, &bad, &root, file_len),
            Err(SwarmError::BadProof { .. })
        ));

        // Append an extra node
        let mut bad = proof.clone();
        bad.nodes.push(ProofNode {
            hash: [0u8; 32],
            level: 0,
        });
        assert!(matches!(
            verify_proof(segment, &bad, &root, file_len),
            Err(SwarmError::BadProof { .. })
        ));
    }

    #[test]
    fn test_empty_leaf_range_rejected() {
        let proof = Proof {
            leaf_start: 0,
            leaf_count: 0,
            nodes: Vec::new(),
        };
        let err = verify_proof(&[], &proof, &[0u8; 32], 1024).unwrap_err();
        assert!(matches!(err, SwarmError::BadProof { .. }));
    }

    #[test]
    fn test_last_short_unit() {
        // Last unit ends mid-leaf: 100 KiB file, second unit is 36 KiB
        let file_len = 100 * 1024u64 + 100;
        let data = patterned(file_len as usize);
        let tmp = temp_file_with(&data);
        let file = File::open(tmp.path()).unwrap();

        let root = compute_root(&file, file_len).unwrap();
        let offset = UNIT_SIZE;
        let length = file_len - offset;
        let (proof, generated_root) = generate_proof(&file, file_len, offset, length).unwrap();
        assert_eq!(generated_root, root);

        let segment = &data[offset as usize..];
        verify_proof(segment, &proof, &root, file_len).unwrap();
    }
}
