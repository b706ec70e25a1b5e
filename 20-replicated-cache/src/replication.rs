//! Leader-side fan-out of mutations to joined followers.
//!
//! Every member gets its own forwarding task fed by a bounded queue, so a slow
//! follower only ever delays itself. Delivery is best-effort and at-most-once:
//! a member whose queue overflows, whose round trip times out, or whose socket
//! fails is dropped from the membership and never retried. Within one member,
//! operations arrive in the order the leader accepted them.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    client::{Client, ClientError},
    protocol::{Command, Status},
};

pub type MemberId = u64;

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Bound on one forwarded round trip (write the command, read its status).
    pub timeout: Duration,
    /// Operations buffered per member before it is considered lagging.
    pub queue_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("member fell behind by more than {0} operations")]
    Lagging(usize),
    #[error("member did not answer within {0:?}")]
    Timeout(Duration),
    #[error("member answered with status {0}")]
    Rejected(Status),
    #[error("member removed from membership")]
    Detached,
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Shared handle to the membership set of a leader.
#[derive(Clone)]
pub struct Replicator {
    state: Arc<ReplicatorState>,
}

struct ReplicatorState {
    members: Mutex<HashMap<MemberId, MemberRecord>>,
    next_id: AtomicU64,
    config: ReplicationConfig,
}

struct MemberRecord {
    peer: SocketAddr,
    queue: mpsc::Sender<Command>,
}

impl Replicator {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            state: Arc::new(ReplicatorState {
                members: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Registers a joined connection and starts forwarding mutations to it.
    pub fn add_member(&self, peer: SocketAddr, client: Client) -> MemberId {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, inbox) = mpsc::channel(self.state.config.queue_capacity.max(1));

        self.state
            .members
            .lock()
            .insert(id, MemberRecord { peer, queue });
        info!(peer = %peer, member = id, "member joined");

        let replicator = self.clone();
        tokio::spawn(async move {
            let reason = forward_to_member(&replicator, client, inbox).await;
            if replicator.remove_member(id) {
                warn!(peer = %peer, member = id, error = %reason, "member dropped");
            } else {
                debug!(peer = %peer, member = id, "member forwarding stopped");
            }
        });

        id
    }

    /// Queues `command` for every current member without waiting on any of them.
    pub fn replicate(&self, command: &Command) {
        let capacity = self.state.config.queue_capacity;
        let mut members = self.state.members.lock();

        members.retain(|id, member| match member.queue.try_send(command.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let err = ReplicationError::Lagging(capacity);
                warn!(peer = %member.peer, member = *id, error = %err, "member dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %member.peer, member = *id, "member already gone");
                false
            }
        });
    }

    /// Removes a member. Returns whether it was still registered.
    pub fn remove_member(&self, id: MemberId) -> bool {
        self.state.members.lock().remove(&id).is_some()
    }

    /// Drops every member, closing their replication channels.
    pub fn clear(&self) {
        self.state.members.lock().clear();
    }

    pub fn member_count(&self) -> usize {
        self.state.members.lock().len()
    }

    pub fn member_addrs(&self) -> Vec<SocketAddr> {
        self.state
            .members
            .lock()
            .values()
            .map(|member| member.peer)
            .collect()
    }
}

enum MemberEvent {
    Forward(Command),
    Detached,
    Disconnected(ClientError),
}

async fn forward_to_member(
    replicator: &Replicator,
    mut client: Client,
    mut inbox: mpsc::Receiver<Command>,
) -> ReplicationError {
    let timeout = replicator.state.config.timeout;

    loop {
        // While idle, watch the socket so a departed follower is pruned right away.
        let event = select! {
            command = inbox.recv() => match command {
                Some(command) => MemberEvent::Forward(command),
                None => MemberEvent::Detached,
            },
            err = client.closed() => MemberEvent::Disconnected(err),
        };

        let command = match event {
            MemberEvent::Forward(command) => command,
            MemberEvent::Detached => return ReplicationError::Detached,
            MemberEvent::Disconnected(err) => return err.into(),
        };

        if let Err(err) = forward(&mut client, &command, timeout).await {
            return err;
        }
    }
}

async fn forward(
    client: &mut Client,
    command: &Command,
    timeout: Duration,
) -> Result<(), ReplicationError> {
    let response = time::timeout(timeout, client.request(command))
        .await
        .map_err(|_| ReplicationError::Timeout(timeout))??;

    match response.status() {
        Status::Ok => Ok(()),
        status => Err(ReplicationError::Rejected(status)),
    }
}
