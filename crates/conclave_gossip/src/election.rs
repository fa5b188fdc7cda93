//! Master election and liveness over the shared medium.
//!
//! There is no lock on the medium. Mastership is settled by an optimistic
//! write to the master slot, a settle window in which a competing write may
//! supersede it, and last-writer-wins. Election runs as an explicit step
//! loop; a failed check never recurses.

use std::time::Duration;

use tracing::{debug, info, warn};

use conclave_core::util::{backoff, random_between, settle};
use conclave_core::{AliveStatus, CHECK_ALIVE, CheckAliveReply, Peer, Result};
use tokio::sync::oneshot;

use crate::transport::Shared;

/// Where a context is in the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started, or destroyed.
    Idle,
    /// Reading the master slot and probing the named master.
    Verifying,
    /// Writing a claim to the master slot.
    Electing,
    /// Waiting out the settle window after a claim.
    Settling,
    Leader,
    Follower,
}

enum Step {
    Inspect,
    Verify(Peer),
    Claim,
    Done,
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// Leader or Follower, from the current master pointer.
    fn settle_phase(&self) {
        let phase = if self.endpoint.is_destroyed() {
            Phase::Idle
        } else if self.endpoint.is_master_now() {
            Phase::Leader
        } else {
            Phase::Follower
        };
        self.set_phase(phase);
    }

    /// Run one election. `retry` skips straight to claiming: the caller has
    /// already decided the named master is dead.
    pub(crate) async fn elect(&self, retry: bool) {
        let mut step = if retry { Step::Claim } else { Step::Inspect };
        loop {
            if self.endpoint.is_destroyed() {
                return;
            }
            step = match step {
                Step::Inspect => {
                    self.set_phase(Phase::Verifying);
                    if self.endpoint.master().is_some() {
                        Step::Done
                    } else {
                        match self.read_master_slot() {
                            None => Step::Claim,
                            Some(master) if self.endpoint.is_self(&master.id) => {
                                debug!("Master slot already names us");
                                self.update_master(master);
                                Step::Done
                            }
                            Some(master) => Step::Verify(master),
                        }
                    }
                }
                Step::Verify(master) => match self.check_alive(&master, self.config.check_timeout).await {
                    Ok(AliveStatus::Ok) => {
                        debug!("Master {master} is alive");
                        self.update_master(master);
                        Step::Done
                    }
                    Ok(AliveStatus::Correction) => {
                        if self.adopt_slot() {
                            Step::Done
                        } else {
                            Step::Claim
                        }
                    }
                    Err(e) => {
                        info!("Master {master} did not answer ({e}), claiming");
                        // Let queued medium notifications land before deciding.
                        settle().await;
                        Step::Claim
                    }
                },
                Step::Claim => {
                    self.claim().await;
                    Step::Done
                }
                Step::Done => break,
            };
        }
        self.settle_phase();
    }

    /// Write ourselves to the master slot and wait out the settle window.
    /// An observed master write ends the wait early.
    async fn claim(&self) {
        if self.endpoint.master().is_some() {
            return;
        }
        self.set_phase(Phase::Electing);

        let (tx, rx) = oneshot::channel();
        *self.pending_claim.lock() = Some(tx);
        let me = self.endpoint.current();
        debug!("Claiming mastership as {me}");
        if let Err(e) = self.write_master_slot(&me) {
            warn!("Failed to write master claim: {e}");
        }

        self.set_phase(Phase::Settling);
        tokio::select! {
            _ = tokio::time::sleep(self.config.settle_window) => {}
            _ = rx => debug!("Claim settled early by an observed write"),
        }
        self.pending_claim.lock().take();

        if self.endpoint.master().is_none() {
            let winner = self.read_master_slot().unwrap_or(me);
            self.update_master(winner);
        }
    }

    async fn check_alive(&self, master: &Peer, timeout: Duration) -> Result<AliveStatus> {
        let reply = self
            .endpoint
            .call_within(master, CHECK_ALIVE, Vec::new(), Some(timeout))
            .await?;
        Ok(serde_json::from_value::<CheckAliveReply>(reply)?.status)
    }

    /// Point at whoever the master slot names now. `false` if it is empty.
    fn adopt_slot(&self) -> bool {
        match self.read_master_slot() {
            Some(master) => {
                debug!("Adopting master {master} from the slot");
                self.update_master(master);
                true
            }
            None => false,
        }
    }

    /// Apply an observed master write.
    pub(crate) fn update_master(&self, peer: Peer) {
        let transition = self.endpoint.observe_master(peer.clone());
        if transition.lost {
            info!("Lost mastership to {peer}");
            self.role_changed.notify_one();
        }
        if transition.gained {
            info!("{} is now master", self.endpoint.current());
        }
        let settled = matches!(*self.phase.lock(), Phase::Leader | Phase::Follower);
        if settled {
            self.settle_phase();
        }
        if let Some(tx) = self.pending_claim.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Follower duty: check the master every heartbeat. Parks while this
    /// context is master and resumes when mastership is lost.
    pub(crate) async fn watch_master(&self) {
        loop {
            if self.endpoint.is_destroyed() {
                return;
            }
            if self.endpoint.is_master_now() {
                self.role_changed.notified().await;
                continue;
            }
            tokio::time::sleep(self.config.master_heartbeat).await;
            self.check_master_alive().await;
        }
    }

    /// One liveness round: 2..=4 checks with escalating backoff. A round in
    /// which every check fails re-runs the election, unless the pointer moved
    /// to someone else meanwhile.
    pub(crate) async fn check_master_alive(&self) {
        let attempts = random_between(self.config.master_retries_min, self.config.master_retries_max);
        for attempt in 0..attempts {
            if self.endpoint.is_destroyed() {
                return;
            }
            let Some(target) = self.endpoint.master() else {
                self.elect(false).await;
                return;
            };
            if self.endpoint.is_self(&target.id) {
                return;
            }

            match self.check_alive(&target, self.config.master_check_timeout).await {
                Ok(AliveStatus::Ok) => return,
                Ok(AliveStatus::Correction) => {
                    self.adopt_slot();
                    return;
                }
                Err(e) if attempt + 1 == attempts => {
                    let moved = self
                        .endpoint
                        .master()
                        .is_some_and(|current| current.id != target.id);
                    if moved {
                        debug!("Master changed during liveness round, following the new one");
                        return;
                    }
                    info!("Master {target} unresponsive after {attempts} checks ({e}), re-electing");
                    self.endpoint.clear_master();
                    self.elect(true).await;
                    return;
                }
                Err(e) => {
                    debug!("liveness check {} of {attempts} to {target} failed: {e}", attempt + 1);
                    tokio::time::sleep(backoff(attempt, self.config.master_retry_backoff)).await;
                }
            }
        }
    }
}
