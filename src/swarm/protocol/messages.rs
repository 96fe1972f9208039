//! Binary serialization of peer wire messages
//!
//! Every frame on a session is `u32 big-endian length ‖ envelope`. The
//! envelope carries the 32-byte info hash, a one-byte message type, and the
//! type-specific payload. Proof nodes travel as raw 32-byte hashes with a
//! u32 level.

use bytes::{Buf, BufMut, Bytes};

use super::types::{Envelope, PeerMessage, Proof, ProofNode};
use crate::swarm::{InfoHash, NodeKey, SwarmError};

/// Message serialization utilities for the peer wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes an envelope to its wire form (without the length prefix).
    pub fn serialize_envelope(envelope: &Envelope) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(envelope.info_hash.as_bytes());
        buf.put_u8(envelope.message.kind());

        match &envelope.message {
            PeerMessage::Handshake { info_hash, peer_id } => {
                buf.extend_from_slice(info_hash.as_bytes());
                put_bytes(&mut buf, peer_id.as_str().as_bytes());
            }
            PeerMessage::Bitfield { bits } => {
                put_bytes(&mut buf, bits);
            }
            PeerMessage::Have { unit_index } => {
                buf.put_u64(*unit_index);
            }
            PeerMessage::Request { unit_index } => {
                buf.put_u64(*unit_index);
            }
            PeerMessage::Transfer {
                unit_index,
                data,
                proof,
            } => {
                buf.put_u64(*unit_index);
                put_bytes(&mut buf, data);
                match proof {
                    Some(proof) => {
                        buf.put_u8(1);
                        Self::serialize_proof(&mut buf, proof);
                    }
                    None => buf.put_u8(0),
                }
            }
            PeerMessage::Reject { unit_index, reason } => {
                buf.put_u64(*unit_index);
                put_bytes(&mut buf, reason.as_bytes());
            }
        }

        buf
    }

    /// Deserializes an envelope from its wire form.
    pub fn deserialize_envelope(data: &[u8]) -> Result<Envelope, SwarmError> {
        let mut buf = data;

        let info_hash = take_hash(&mut buf)?;
        need(buf, 1, "message type")?;
        let kind = buf.get_u8();

        let message = match kind {
            0 => {
                let hs_info_hash = take_hash(&mut buf)?;
                let peer_id = take_bytes(&mut buf, "peer id")?;
                let peer_id = String::from_utf8(peer_id.to_vec()).map_err(|_| {
                    SwarmError::Malformed {
                        message: "handshake peer id is not UTF-8".to_string(),
                    }
                })?;
                PeerMessage::Handshake {
                    info_hash: hs_info_hash,
                    peer_id: NodeKey::new(peer_id),
                }
            }
            1 => PeerMessage::Bitfield {
                bits: take_bytes(&mut buf, "bitfield")?,
            },
            2 => {
                need(buf, 8, "have index")?;
                PeerMessage::Have {
                    unit_index: buf.get_u64(),
                }
            }
            3 => {
                need(buf, 8, "request index")?;
                PeerMessage::Request {
                    unit_index: buf.get_u64(),
                }
            }
            4 => {
                need(buf, 8, "transfer index")?;
                let unit_index = buf.get_u64();
                let data = take_bytes(&mut buf, "transfer data")?;
                need(buf, 1, "proof flag")?;
                let proof = match buf.get_u8() {
                    0 => None,
                    1 => Some(Self::deserialize_proof(&mut buf)?),
                    flag => {
                        return Err(SwarmError::Malformed {
                            message: format!("unknown proof flag: {flag}"),
                        });
                    }
                };
                PeerMessage::Transfer {
                    unit_index,
                    data,
                    proof,
                }
            }
            5 => {
                need(buf, 8, "reject index")?;
                let unit_index = buf.get_u64();
                let reason = take_bytes(&mut buf, "reject reason")?;
                let reason =
                    String::from_utf8(reason.to_vec()).map_err(|_| SwarmError::Malformed {
                        message: "reject reason is not UTF-8".to_string(),
                    })?;
                PeerMessage::Reject { unit_index, reason }
            }
            _ => {
                return Err(SwarmError::Malformed {
                    message: format!("unknown message type: {kind}"),
                });
            }
        };

        if buf.has_remaining() {
            return Err(SwarmError::Malformed {
                message: format!("{} trailing bytes after payload", buf.remaining()),
            });
        }

        Ok(Envelope { info_hash, message })
    }

    fn serialize_proof(buf: &mut Vec<u8>, proof: &Proof) {
        buf.put_u64(proof.leaf_start);
        buf.put_u64(proof.leaf_count);
        buf.put_u32(proof.nodes.len() as u32);
        for node in &proof.nodes {
            buf.extend_from_slice(&node.hash);
            buf.put_u32(u32::from(node.level));
        }
    }

    fn deserialize_proof(buf: &mut &[u8]) -> Result<Proof, SwarmError> {
        need(*buf, 8 + 8 + 4, "proof header")?;
        let leaf_start = buf.get_u64();
        let leaf_count = buf.get_u64();
        let node_count = buf.get_u32() as usize;

        // 32-byte hash + u32 level per node
        let nodes_len = node_count.checked_mul(36).ok_or(SwarmError::Malformed {
            message: format!("proof node count out of range: {node_count}"),
        })?;
        need(*buf, nodes_len, "proof nodes")?;

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let mut hash = [0u8; 32];
            buf.copy_to_slice(&mut hash);
            let level = buf.get_u32();
            let level = u8::try_from(level).map_err(|_| SwarmError::Malformed {
                message: format!("proof node level out of range: {level}"),
            })?;
            nodes.push(ProofNode { hash, level });
        }

        Ok(Proof {
            leaf_start,
            leaf_count,
            nodes,
        })
    }
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
}

fn take_bytes(buf: &mut &[u8], what: &str) -> Result<Bytes, SwarmError> {
    need(*buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(*buf, len, what)?;
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}

fn take_hash(buf: &mut &[u8]) -> Result<InfoHash, SwarmError> {
    need(*buf, 32, "info hash")?;
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    Ok(InfoHash::new(hash))
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<(), SwarmError> {
    if buf.len() < n {
        return Err(SwarmError::Malformed {
            message: format!("truncated {what}: need {n} bytes, have {}", buf.len()),
        });
    }
    Ok(())
}
