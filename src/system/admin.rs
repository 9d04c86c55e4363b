use crate::engine::{EngineError, PeerConfig, PeerId, RaftEngine};
use crate::system::system::RaftJournalSystem;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Let the membership change propagate before asking for the election.
const TRANSFER_START_DELAY: Duration = Duration::from_secs(3);
const TRANSFER_LEADER_WAIT: Duration = Duration::from_secs(30);

const NEUTRAL_PRIORITY: u32 = 1;
const TRANSFER_TARGET_PRIORITY: u32 = 2;

// Reported while the quorum has no usable leader information.
const WAITING_FOR_ELECTION: &str = "WAITING_FOR_ELECTION";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QuorumServerState {
    Available,
    Unavailable,
}

/// Operator view of one quorum member.
#[derive(Debug, Clone)]
pub struct QuorumServerInfo {
    pub addr: SocketAddr,
    pub is_leader: bool,
    pub priority: u32,
    pub state: QuorumServerState,
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("journal system is not started")]
    NotStarted,

    #[error("<{addr}> is not part of the quorum")]
    NotInQuorum { addr: SocketAddr },

    #[error("{addr} is already the leader")]
    AlreadyLeader { addr: SocketAddr },

    #[error("{addr} is still available; only unavailable peers can be removed")]
    StillAvailable { addr: SocketAddr },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Quorum administration: the operator surface wrapping engine admin
/// calls. Membership changes go through the engine's configuration path;
/// leadership transfer is fire-and-forget with its outcome queryable by
/// transfer id, because a successful transfer shuts down this peer's RPC
/// servers mid-call.
impl RaftJournalSystem {
    pub async fn quorum_server_info(&self) -> Result<Vec<QuorumServerInfo>, AdminError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(AdminError::NotStarted)?;
        let info = state.engine.group_info()?;

        let mut servers: Vec<QuorumServerInfo> = info
            .peers
            .iter()
            .map(|status| QuorumServerInfo {
                addr: status.peer.addr,
                is_leader: info.leader_id.as_ref() == Some(&status.peer.id),
                priority: status.peer.priority,
                state: match status.last_contact {
                    Some(elapsed) if elapsed > self.options.election_timeout_max => {
                        QuorumServerState::Unavailable
                    }
                    _ => QuorumServerState::Available,
                },
            })
            .collect();
        servers.sort_by_key(|server| server.addr.to_string());
        Ok(servers)
    }

    /// Adds a server to the quorum. A no-op if the server is already a
    /// member.
    pub async fn add_quorum_server(&self, addr: SocketAddr) -> Result<(), AdminError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(AdminError::NotStarted)?;
        let info = state.engine.group_info()?;

        let peer_id = PeerId::from_addr(&addr);
        if info.peers.iter().any(|status| status.peer.id == peer_id) {
            return Ok(());
        }
        let mut peers: Vec<PeerConfig> = info.peers.into_iter().map(|status| status.peer).collect();
        peers.push(PeerConfig::new(addr));
        state.engine.set_configuration(peers).await?;
        slog::info!(self.logger, "Added quorum server"; "addr" => %addr);
        Ok(())
    }

    /// Removes a server from the quorum. The server must already be
    /// unavailable; removing a healthy peer is an operator mistake.
    pub async fn remove_quorum_server(&self, addr: SocketAddr) -> Result<(), AdminError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(AdminError::NotStarted)?;
        let info = state.engine.group_info()?;

        let peer_id = PeerId::from_addr(&addr);
        let target = info
            .peers
            .iter()
            .find(|status| status.peer.id == peer_id)
            .ok_or(AdminError::NotInQuorum { addr })?;
        match target.last_contact {
            Some(elapsed) if elapsed > self.options.election_timeout_max => {}
            _ => return Err(AdminError::StillAvailable { addr }),
        }

        let peers: Vec<PeerConfig> = info
            .peers
            .iter()
            .filter(|status| status.peer.id != peer_id)
            .map(|status| status.peer.clone())
            .collect();
        state.engine.set_configuration(peers).await?;
        slog::info!(self.logger, "Removed quorum server"; "addr" => %addr);
        Ok(())
    }

    /// Resets every peer's election priority to a common neutral value,
    /// undoing the skew left behind by leadership transfers.
    pub async fn reset_priorities(&self) -> Result<(), AdminError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(AdminError::NotStarted)?;
        let info = state.engine.group_info()?;

        let peers: Vec<PeerConfig> = info
            .peers
            .into_iter()
            .map(|status| status.peer.with_priority(NEUTRAL_PRIORITY))
            .collect();
        slog::info!(self.logger, "Resetting quorum peer priorities");
        state.engine.set_configuration(peers).await?;
        Ok(())
    }

    /// Hands leadership to the server at `new_leader`. Returns a transfer
    /// id immediately; query `transfer_leader_message` with it later. An
    /// empty message means no recorded failure. Success is observed
    /// out-of-band, when this peer transitions to standby.
    pub async fn transfer_leadership(&self, new_leader: SocketAddr) -> Uuid {
        let transfer_id = Uuid::new_v4();
        let allowed = self.transfer_allowed.swap(false, Ordering::SeqCst);
        if !allowed {
            let still_gaining = match self.state.lock().await.as_ref() {
                Some(state) => !state.has_writer(),
                None => true,
            };
            let msg = format!(
                "transfer is not allowed at the moment because the master is {}",
                if still_gaining {
                    "still gaining primacy"
                } else {
                    "already transferring the leadership"
                }
            );
            self.record_transfer_error(transfer_id, msg);
            return transfer_id;
        }

        let (engine, target_id) = match self.prepare_transfer(new_leader).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.transfer_allowed.store(true, Ordering::SeqCst);
                slog::warn!(self.logger, "{}", e);
                self.record_transfer_error(transfer_id, e.to_string());
                return transfer_id;
            }
        };

        // Fire and forget: the engine shuts down our RPC surface once the
        // transfer request lands, so nobody could read a synchronous reply.
        let logger = self.logger.clone();
        let transfer_allowed = Arc::clone(&self.transfer_allowed);
        let transfer_errors = Arc::clone(&self.transfer_errors);
        tokio::spawn(async move {
            tokio::time::sleep(TRANSFER_START_DELAY).await;
            match engine
                .transfer_leadership(target_id.clone(), TRANSFER_LEADER_WAIT)
                .await
            {
                Ok(()) => {
                    slog::info!(logger, "Leadership transfer succeeded"; "target" => %target_id);
                }
                Err(e) => {
                    slog::error!(logger, "Caught an error when executing transfer"; "error" => %e);
                    // Only a failed transfer re-opens the gate: success
                    // means this peer is about to lose primacy anyway.
                    transfer_allowed.store(true, Ordering::SeqCst);
                    transfer_errors
                        .lock()
                        .expect("transfer error map poisoned")
                        .insert(transfer_id, e.to_string());
                }
            }
        });
        slog::info!(self.logger, "Transferring leadership initiated"; "target" => %new_leader);
        transfer_id
    }

    /// The current leader's peer id, or a waiting-for-election marker when
    /// the quorum has not settled on one.
    pub async fn leader_id(&self) -> String {
        let guard = self.state.lock().await;
        let state = match guard.as_ref() {
            Some(state) => state,
            None => return WAITING_FOR_ELECTION.to_string(),
        };
        match state.engine.group_info() {
            Ok(info) => match info.leader_id {
                Some(id) => id.into_inner(),
                None => WAITING_FOR_ELECTION.to_string(),
            },
            Err(e) => {
                slog::warn!(self.logger, "Error while getting group info"; "error" => %e);
                WAITING_FOR_ELECTION.to_string()
            }
        }
    }

    /// The leader's index into the configured cluster address list, or -1
    /// when no leader is known.
    pub async fn leader_index(&self) -> i32 {
        let leader_id = self.leader_id().await;
        if leader_id == WAITING_FOR_ELECTION {
            return -1;
        }
        for (i, addr) in self.cluster_addrs().iter().enumerate() {
            if PeerId::from_addr(addr).into_inner() == leader_id {
                return i as i32;
            }
        }
        -1
    }

    /// The failure diagnostic recorded for a transfer, or an empty string
    /// if none was (the success path records nothing).
    pub fn transfer_leader_message(&self, transfer_id: &Uuid) -> String {
        self.transfer_errors
            .lock()
            .expect("transfer error map poisoned")
            .get(transfer_id)
            .cloned()
            .unwrap_or_default()
    }

    // Validates the target and raises its election priority above the rest
    // of the quorum so the engine's transfer can succeed.
    async fn prepare_transfer(
        &self,
        new_leader: SocketAddr,
    ) -> Result<(Arc<dyn RaftEngine>, PeerId), AdminError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(AdminError::NotStarted)?;
        let info = state.engine.group_info()?;

        let target_id = PeerId::from_addr(&new_leader);
        if !info.peers.iter().any(|status| status.peer.id == target_id) {
            return Err(AdminError::NotInQuorum { addr: new_leader });
        }
        if target_id == self.local_peer().id {
            return Err(AdminError::AlreadyLeader { addr: new_leader });
        }

        let peers: Vec<PeerConfig> = info
            .peers
            .into_iter()
            .map(|status| {
                let priority = if status.peer.id == target_id {
                    TRANSFER_TARGET_PRIORITY
                } else {
                    NEUTRAL_PRIORITY
                };
                status.peer.with_priority(priority)
            })
            .collect();
        slog::info!(
            self.logger,
            "Applying new peer state before transferring leadership";
            "target" => %target_id
        );
        state.engine.set_configuration(peers).await?;
        Ok((Arc::clone(&state.engine), target_id))
    }

    fn record_transfer_error(&self, transfer_id: Uuid, msg: String) {
        self.transfer_errors
            .lock()
            .expect("transfer error map poisoned")
            .insert(transfer_id, msg);
    }
}
