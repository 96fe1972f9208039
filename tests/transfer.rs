//! End-to-end transfer tests over the in-process overlay: real clients,
//! session managers, schedulers, and proof verification on every unit.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baobun::config::BaobunConfig;
use baobun::session::memory::{MemoryNetwork, MemoryOverlay};
use baobun::session::{Connection, Overlay, SessionManager};
use baobun::swarm::bitfield::Bitfield;
use baobun::swarm::merkle;
use baobun::swarm::protocol::{Envelope, MessageCodec, PeerMessage};
use baobun::swarm::tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerInfo, TrackerTransport,
};
use baobun::{Client, Descriptor, NodeKey, SwarmError};

/// Tracker stub returning a fixed peer list for every announce.
struct StaticTracker {
    peers: Vec<NodeKey>,
}

#[async_trait]
impl TrackerTransport for StaticTracker {
    async fn announce(
        &self,
        _tracker: &str,
        _request: AnnounceRequest,
    ) -> Result<AnnounceResponse, SwarmError> {
        Ok(AnnounceResponse {
            interval: 10,
            peers: self
                .peers
                .iter()
                .map(|key| PeerInfo {
                    node_key: key.clone(),
                    is_seeder: true,
                })
                .collect(),
        })
    }

    async fn close(&self) {}
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

fn spawn_node(
    network: &Arc<MemoryNetwork>,
    key: &str,
    tracker_peers: Vec<NodeKey>,
) -> (Arc<Client>, Arc<SessionManager>) {
    let config = BaobunConfig::for_testing();
    let overlay = Arc::new(network.join(NodeKey::new(key)));
    let sessions = SessionManager::new(overlay, config.clone());
    let client = Client::new(
        Arc::new(StaticTracker {
            peers: tracker_peers,
        }),
        Arc::clone(&sessions),
        config,
    );
    (client, sessions)
}

/// Writes the source file into a seeder directory and returns its
/// descriptor.
fn prepare_source(dir: &Path, name: &str, data: &[u8]) -> Descriptor {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    Descriptor::create_from_file(&path, vec!["tracker-main".to_string()]).unwrap()
}

async fn wait_until_complete(swarm: &Arc<baobun::Swarm>, deadline: Duration) {
    let start = std::time::Instant::now();
    while !swarm.store().all_units() {
        if start.elapsed() > deadline {
            panic!(
                "download did not complete: {} of {} units",
                swarm.store().bitfield().count(),
                swarm.store().unit_count()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_single_seeder_download() {
    let network = MemoryNetwork::new();
    let data = patterned(500 * 1024);

    let seeder_dir = tempfile::tempdir().unwrap();
    let descriptor = prepare_source(seeder_dir.path(), "payload.bin", &data);
    let info_hash = descriptor.info_hash();

    let (seeder, _seeder_sessions) = spawn_node(&network, "seeder", vec![]);
    seeder.import(descriptor.clone(), seeder_dir.path()).unwrap();
    assert!(seeder.swarm(info_hash).unwrap().store().all_units());

    let leecher_dir = tempfile::tempdir().unwrap();
    let (leecher, _leecher_sessions) =
        spawn_node(&network, "leecher", vec![NodeKey::new("seeder")]);
    leecher.import(descriptor, leecher_dir.path()).unwrap();

    leecher
        .announce_swarm(info_hash, AnnounceEvent::Started)
        .await;

    let swarm = leecher.swarm(info_hash).unwrap();
    wait_until_complete(&swarm, Duration::from_secs(30)).await;

    // Byte-for-byte equality with the source
    let downloaded = std::fs::read(leecher_dir.path().join("payload.bin")).unwrap();
    assert_eq!(downloaded, data);

    // Every unit arrived with a proof that is now cached
    for unit in 0..swarm.store().unit_count() {
        assert!(swarm.has_proof(unit), "no cached proof for unit {unit}");
    }

    assert_eq!(swarm.downloaded(), data.len() as u64);
    let seeder_swarm = seeder.swarm(info_hash).unwrap();
    assert_eq!(seeder_swarm.uploaded(), data.len() as u64);
}

#[tokio::test]
async fn test_two_seeders_download() {
    let network = MemoryNetwork::new();
    let data = patterned(2 * 1024 * 1024 + 12_345);

    let dir_a = tempfile::tempdir().unwrap();
    let descriptor = prepare_source(dir_a.path(), "big.bin", &data);
    let info_hash = descriptor.info_hash();

    let dir_b = tempfile::tempdir().unwrap();
    std::fs::write(dir_b.path().join("big.bin"), &data).unwrap();

    let (seeder_a, _sa) = spawn_node(&network, "seeder-a", vec![]);
    seeder_a.import(descriptor.clone(), dir_a.path()).unwrap();
    let (seeder_b, _sb) = spawn_node(&network, "seeder-b", vec![]);
    seeder_b.import(descriptor.clone(), dir_b.path()).unwrap();

    let leecher_dir = tempfile::tempdir().unwrap();
    let (leecher, _ls) = spawn_node(
        &network,
        "leecher",
        vec![NodeKey::new("seeder-a"), NodeKey::new("seeder-b")],
    );
    leecher.import(descriptor, leecher_dir.path()).unwrap();

    leecher
        .announce_swarm(info_hash, AnnounceEvent::Started)
        .await;

    let swarm = leecher.swarm(info_hash).unwrap();
    wait_until_complete(&swarm, Duration::from_secs(60)).await;

    let downloaded = std::fs::read(leecher_dir.path().join("big.bin")).unwrap();
    assert_eq!(downloaded, data);

    for unit in 0..swarm.store().unit_count() {
        assert!(swarm.has_proof(unit), "no cached proof for unit {unit}");
    }

    // Everything the leecher got came from the two seeders
    let total_uploaded = seeder_a.swarm(info_hash).unwrap().uploaded()
        + seeder_b.swarm(info_hash).unwrap().uploaded();
    assert_eq!(total_uploaded, data.len() as u64);
}

/// Runs a hand-rolled wire peer: handshakes, advertises every unit, and
/// answers requests through `serve`.
fn spawn_scripted_peer<F>(overlay: MemoryOverlay, descriptor: Descriptor, serve: F)
where
    F: Fn(u64) -> Option<PeerMessage> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let serve = Arc::new(serve);
        let descriptor = Arc::new(descriptor);
        loop {
            let Ok((_, conn)) = overlay.accept().await else {
                return;
            };
            let serve = Arc::clone(&serve);
            let descriptor = Arc::clone(&descriptor);
            let key = overlay.local_key();
            tokio::spawn(async move {
                let info_hash = descriptor.info_hash();
                loop {
                    let Ok(frame) = read_frame(conn.as_ref()).await else {
                        return;
                    };
                    let Ok(envelope) = MessageCodec::deserialize_envelope(&frame) else {
                        return;
                    };
                    match envelope.message {
                        PeerMessage::Handshake { .. } => {
                            send_message(
                                conn.as_ref(),
                                info_hash,
                                PeerMessage::Handshake {
                                    info_hash,
                                    peer_id: key.clone(),
                                },
                            )
                            .await;

                            let mut bits = Bitfield::new(descriptor.unit_count());
                            for i in 0..descriptor.unit_count() {
                                bits.set(i);
                            }
                            send_message(
                                conn.as_ref(),
                                info_hash,
                                PeerMessage::Bitfield {
                                    bits: bits.bytes().to_vec().into(),
                                },
                            )
                            .await;
                        }
                        PeerMessage::Request { unit_index } => {
                            if let Some(reply) = serve(unit_index) {
                                send_message(conn.as_ref(), info_hash, reply).await;
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });
}

async fn read_frame(conn: &dyn Connection) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    conn.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn send_message(conn: &dyn Connection, info_hash: baobun::InfoHash, message: PeerMessage) {
    let payload = MessageCodec::serialize_envelope(&Envelope { info_hash, message });
    let _ = conn
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await;
    let _ = conn.write_all(&payload).await;
}

#[tokio::test]
async fn test_admission_limits_against_silent_peer() {
    let network = MemoryNetwork::new();
    let data = patterned(32 * 64 * 1024);

    let source_dir = tempfile::tempdir().unwrap();
    let descriptor = prepare_source(source_dir.path(), "stalled.bin", &data);
    let info_hash = descriptor.info_hash();

    // Advertises everything, never serves anything
    let silent = network.join(NodeKey::new("silent"));
    spawn_scripted_peer(silent, descriptor.clone(), |_| None);

    let leecher_dir = tempfile::tempdir().unwrap();
    let (leecher, _ls) = spawn_node(&network, "leecher", vec![NodeKey::new("silent")]);
    leecher.import(descriptor, leecher_dir.path()).unwrap();
    leecher
        .announce_swarm(info_hash, AnnounceEvent::Started)
        .await;

    let swarm = leecher.swarm(info_hash).unwrap();
    let scheduler = swarm.scheduler();
    let silent_key = NodeKey::new("silent");

    // The per-peer cap binds at 8 outstanding requests and stays there
    let start = std::time::Instant::now();
    while scheduler.inflight_count(&silent_key).await < 8 {
        assert!(start.elapsed() < Duration::from_secs(10), "never reached the cap");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.inflight_count(&silent_key).await, 8);
        assert_eq!(scheduler.active_count().await, 8);
    }
}

#[tokio::test]
async fn test_tampered_proof_is_dropped_and_rescheduled() {
    let network = MemoryNetwork::new();
    let data = patterned(2 * 64 * 1024);

    let source_dir = tempfile::tempdir().unwrap();
    let descriptor = prepare_source(source_dir.path(), "tampered.bin", &data);
    let info_hash = descriptor.info_hash();

    // Serves real data with proofs whose node levels are off by one
    let evil_dir = tempfile::tempdir().unwrap();
    let evil_path = evil_dir.path().join("tampered.bin");
    std::fs::write(&evil_path, &data).unwrap();
    let evil = network.join(NodeKey::new("evil"));
    let evil_descriptor = descriptor.clone();
    spawn_scripted_peer(evil, descriptor.clone(), move |unit_index| {
        let file = std::fs::File::open(&evil_path).unwrap();
        let length = evil_descriptor.unit_size(unit_index).unwrap();
        let offset = unit_index * 64 * 1024;
        let (mut proof, _) =
            merkle::generate_proof(&file, evil_descriptor.length, offset, length).unwrap();
        let mut unit = vec![0u8; length as usize];
        use std::os::unix::fs::FileExt;
        file.read_exact_at(&mut unit, offset).unwrap();

        for node in proof.nodes.iter_mut() {
            node.level += 1;
        }
        if proof.nodes.is_empty() {
            unit[0] ^= 0x01;
        }

        Some(PeerMessage::Transfer {
            unit_index,
            data: unit.into(),
            proof: Some(proof),
        })
    });

    let leecher_dir = tempfile::tempdir().unwrap();
    let (leecher, leecher_sessions) = spawn_node(&network, "leecher", vec![NodeKey::new("evil")]);
    leecher.import(descriptor.clone(), leecher_dir.path()).unwrap();
    leecher
        .announce_swarm(info_hash, AnnounceEvent::Started)
        .await;

    let swarm = leecher.swarm(info_hash).unwrap();

    // Corrupted transfers never land on disk
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(swarm.store().bitfield().count(), 0);
    assert_eq!(swarm.scheduler().missing_count().await, 0); // all are in flight
    assert!(!swarm.store().has_unit(0));

    // After the request timeout the units revert and an honest seeder wins
    let (honest, _hs) = spawn_node(&network, "honest", vec![]);
    honest.import(descriptor, source_dir.path()).unwrap();

    let start = std::time::Instant::now();
    while swarm.scheduler().attempts(0).await == 0 && swarm.scheduler().attempts(1).await == 0 {
        assert!(
            start.elapsed() < Duration::from_secs(20),
            "request never timed out"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Take the malicious peer out of selection so retries go to the honest
    // seeder
    if let Some(handler) = swarm.peer(&NodeKey::new("evil")) {
        handler.close(None).await;
    }

    leecher_sessions
        .connect_peer(&swarm, NodeKey::new("honest"), Duration::from_secs(5))
        .await
        .unwrap();

    wait_until_complete(&swarm, Duration::from_secs(30)).await;
    let downloaded = std::fs::read(leecher_dir.path().join("tampered.bin")).unwrap();
    assert_eq!(downloaded, data);
}

#[tokio::test]
async fn test_pause_refuses_requests_and_connects() {
    let network = MemoryNetwork::new();
    let data = patterned(4 * 64 * 1024);

    let seeder_dir = tempfile::tempdir().unwrap();
    let descriptor = prepare_source(seeder_dir.path(), "paused.bin", &data);
    let info_hash = descriptor.info_hash();

    let (seeder, _ss) = spawn_node(&network, "seeder", vec![]);
    seeder.import(descriptor.clone(), seeder_dir.path()).unwrap();

    let leecher_dir = tempfile::tempdir().unwrap();
    let (leecher, _ls) = spawn_node(&network, "leecher", vec![NodeKey::new("seeder")]);
    leecher.import(descriptor, leecher_dir.path()).unwrap();

    assert!(leecher.pause_swarm(info_hash).await);
    assert!(leecher.is_paused(info_hash));

    // Announce while paused does nothing: no peers, no progress
    leecher
        .announce_swarm(info_hash, AnnounceEvent::Started)
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let swarm = leecher.swarm(info_hash).unwrap();
    assert!(swarm.peers_snapshot().is_empty());
    assert_eq!(swarm.store().bitfield().count(), 0);

    // Unpausing lets the next announce drive the download
    leecher.unpause_swarm(info_hash);
    leecher
        .announce_swarm(info_hash, AnnounceEvent::None)
        .await;
    wait_until_complete(&swarm, Duration::from_secs(30)).await;
}
