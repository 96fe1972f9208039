//! Transfer scheduler: admission control, peer selection, timeout sweeps
//!
//! One worker task per swarm ticks once a second, first reaping timed-out
//! requests and then issuing new ones. Units are picked in shuffled-random
//! order; for each unit the least-loaded peer that advertises it wins,
//! subject to the global and per-peer admission limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bitfield::Bitfield;
use super::peer::{ConnectionState, PeerHandler};
use super::state::Swarm;
use super::NodeKey;
use crate::config::SchedulerConfig;

/// Download lifecycle of one transfer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not on disk, not requested
    Missing,
    /// Queued for request issue
    Requested,
    /// A request is outstanding
    Downloading,
    /// On disk and verified
    Complete,
    /// Given up on (unused by the current retry policy)
    Failed,
}

struct UnitRequest {
    peer: NodeKey,
    sent_at: Instant,
    #[allow(dead_code)]
    attempts: u32,
    timeout: Duration,
}

pub(crate) enum SchedulerEvent {
    UnitComplete(u64),
    Kick,
}

struct SchedulerState {
    units: Vec<UnitState>,
    attempts: Vec<u32>,
    active: HashMap<u64, UnitRequest>,
    inflight: HashMap<NodeKey, Vec<u64>>,
}

/// Per-swarm download driver.
pub struct Scheduler {
    config: SchedulerConfig,
    events: mpsc::Sender<SchedulerEvent>,
    state: tokio::sync::Mutex<SchedulerState>,
}

impl Scheduler {
    /// Creates the scheduler with units already on disk marked Complete.
    /// The returned receiver must be handed to [`Self::spawn_worker`].
    pub(crate) fn new(
        unit_count: u64,
        have: Bitfield,
        config: SchedulerConfig,
    ) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let units = (0..unit_count)
            .map(|i| {
                if have.has(i) {
                    UnitState::Complete
                } else {
                    UnitState::Missing
                }
            })
            .collect();

        let (events_tx, events_rx) = mpsc::channel(100);
        (
            Self {
                config,
                events: events_tx,
                state: tokio::sync::Mutex::new(SchedulerState {
                    units,
                    attempts: vec![0; unit_count as usize],
                    active: HashMap::new(),
                    inflight: HashMap::new(),
                }),
            },
            events_rx,
        )
    }

    /// Spawns the worker task driving this swarm's downloads. It exits when
    /// the swarm shuts down or is dropped.
    pub(crate) fn spawn_worker(swarm: &Arc<Swarm>, mut events: mpsc::Receiver<SchedulerEvent>) {
        let weak = Arc::downgrade(swarm);
        let mut shutdown = swarm.shutdown_receiver();
        let tick = swarm.config().scheduler.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(swarm) = weak.upgrade() else { break };
                        match event {
                            SchedulerEvent::UnitComplete(index) => {
                                swarm.scheduler().handle_unit_complete(index).await;
                            }
                            SchedulerEvent::Kick => {
                                swarm.scheduler().schedule_downloads(&swarm).await;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        let Some(swarm) = weak.upgrade() else { break };
                        swarm.scheduler().check_timeouts().await;
                        swarm.scheduler().schedule_downloads(&swarm).await;
                    }
                }
            }
            debug!("scheduler worker exited");
        });
    }

    /// Queues a unit-complete event; called from the transfer path.
    pub fn notify_complete(&self, index: u64) {
        if self
            .events
            .try_send(SchedulerEvent::UnitComplete(index))
            .is_err()
        {
            warn!("scheduler event queue full, dropping completion of unit {index}");
        }
    }

    /// Requests an immediate scheduling sweep, e.g. after a bitfield
    /// arrived.
    pub fn kick(&self) {
        let _ = self.events.try_send(SchedulerEvent::Kick);
    }

    async fn handle_unit_complete(&self, index: u64) {
        let mut state = self.state.lock().await;
        if index as usize >= state.units.len() {
            return;
        }

        state.units[index as usize] = UnitState::Complete;
        if let Some(request) = state.active.remove(&index) {
            remove_inflight(&mut state.inflight, &request.peer, index);
        }
        debug!("unit {index} download complete");
    }

    /// Reaps requests older than their timeout: the request record goes,
    /// the unit reverts to Missing so the next sweep may pick a different
    /// peer, and the attempt counter ticks up. Nothing caps attempts; an
    /// unreachable unit is retried forever.
    pub(crate) async fn check_timeouts(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired: Vec<u64> = state
            .active
            .iter()
            .filter(|(_, request)| now.duration_since(request.sent_at) > request.timeout)
            .map(|(&index, _)| index)
            .collect();

        for index in expired {
            let Some(request) = state.active.remove(&index) else {
                continue;
            };
            info!("request for unit {index} from {} timed out", request.peer);
            remove_inflight(&mut state.inflight, &request.peer, index);

            if state.units[index as usize] == UnitState::Downloading {
                state.units[index as usize] = UnitState::Missing;
            }
            state.attempts[index as usize] += 1;
        }
    }

    /// Issues requests for missing units until the admission limits bind.
    pub(crate) async fn schedule_downloads(&self, swarm: &Arc<Swarm>) {
        if swarm.is_paused() {
            return;
        }

        let mut state = self.state.lock().await;
        if state.active.len() >= self.config.max_active_requests {
            return;
        }

        let mut candidates: Vec<u64> = state
            .units
            .iter()
            .enumerate()
            .filter(|(index, unit)| {
                **unit == UnitState::Missing && !state.active.contains_key(&(*index as u64))
            })
            .map(|(index, _)| index as u64)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        for index in candidates {
            let Some(handler) = self.select_peer(&state, swarm, index) else {
                continue;
            };
            let peer = handler.peer().clone();

            match handler.send_request(index).await {
                Ok(()) => {
                    debug!("requested unit {index} from {peer}");
                    let attempts = state.attempts[index as usize] + 1;
                    state.active.insert(index, UnitRequest {
                        peer: peer.clone(),
                        sent_at: Instant::now(),
                        attempts,
                        timeout: self.config.request_timeout,
                    });
                    state.inflight.entry(peer).or_default().push(index);
                    state.units[index as usize] = UnitState::Downloading;
                }
                Err(e) => {
                    warn!("failed to send request for unit {index} to {peer}: {e}");
                }
            }

            if state.active.len() >= self.config.max_active_requests {
                return;
            }
        }
    }

    /// Picks a peer able to serve `unit`: Connected, advertising the unit,
    /// and under the per-peer limit. The least-loaded eligible peer wins;
    /// if none stood out, a uniformly-random eligible peer is used.
    fn select_peer(
        &self,
        state: &SchedulerState,
        swarm: &Arc<Swarm>,
        unit: u64,
    ) -> Option<Arc<PeerHandler>> {
        let mut candidates = Vec::new();
        let mut best: Option<(usize, Arc<PeerHandler>)> = None;

        for handler in swarm.peers_snapshot() {
            if handler.state() != ConnectionState::Connected {
                continue;
            }
            if !handler.has_remote_bitfield() {
                continue;
            }
            if !handler.remote_has(unit) {
                continue;
            }

            let load = state.inflight.get(handler.peer()).map_or(0, Vec::len);
            if load >= self.config.max_requests_per_peer {
                continue;
            }

            candidates.push(Arc::clone(&handler));
            if best.as_ref().is_none_or(|(min, _)| load < *min) {
                best = Some((load, handler));
            }
        }

        if let Some((_, handler)) = best {
            return Some(handler);
        }
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Marks every unit Complete (seeding bootstrap).
    pub async fn mark_all_complete(&self) {
        let mut state = self.state.lock().await;
        for unit in state.units.iter_mut() {
            *unit = UnitState::Complete;
        }
    }

    /// Returns the number of outstanding requests.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Returns the number of outstanding requests to one peer.
    pub async fn inflight_count(&self, peer: &NodeKey) -> usize {
        self.state
            .lock()
            .await
            .inflight
            .get(peer)
            .map_or(0, Vec::len)
    }

    /// Returns the state of one unit, if it exists.
    pub async fn unit_state(&self, index: u64) -> Option<UnitState> {
        self.state.lock().await.units.get(index as usize).copied()
    }

    /// Returns how many units are still Missing.
    pub async fn missing_count(&self) -> usize {
        self.state
            .lock()
            .await
            .units
            .iter()
            .filter(|unit| **unit == UnitState::Missing)
            .count()
    }

    /// Returns how often requests for `index` have been issued or timed
    /// out.
    pub async fn attempts(&self, index: u64) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }
}

fn remove_inflight(inflight: &mut HashMap<NodeKey, Vec<u64>>, peer: &NodeKey, index: u64) {
    if let Some(units) = inflight.get_mut(peer) {
        units.retain(|&u| u != index);
        if units.is_empty() {
            inflight.remove(peer);
        }
    }
}
