use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    client::Client,
    protocol::{read_command, Command, Response, Status, DEFAULT_MAX_FIELD_LEN},
    replication::{ReplicationConfig, Replicator},
    store::{ttl_from_seconds, Cache, StoreError},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Leader to follow. `None` makes this node a leader.
    pub leader: Option<SocketAddr>,
    pub max_field_len: usize,
    /// Closes client connections that stay silent this long. Never applied to
    /// replication channels.
    pub idle_timeout: Option<Duration>,
    pub reconnect_delay: Duration,
    pub replication: ReplicationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            leader: None,
            max_field_len: DEFAULT_MAX_FIELD_LEN,
            idle_timeout: None,
            reconnect_delay: Duration::from_secs(1),
            replication: ReplicationConfig::default(),
        }
    }
}

enum Role {
    Leader(Replicator),
    Follower(SocketAddr),
}

/// Where the commands on a connection come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Leader,
}

enum SessionEnd {
    Closed,
    Joined,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    cache: Cache,
    role: Role,
    config: ServerConfig,
    // Held across applying a client mutation and queueing it for members.
    write_order: Mutex<()>,
}

impl ServerState {
    fn new(role: Role, config: ServerConfig) -> Self {
        Self {
            cache: Cache::new(),
            role,
            config,
            write_order: Mutex::new(()),
        }
    }
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let role = match config.leader {
            Some(leader) => Role::Follower(leader),
            None => Role::Leader(Replicator::new(config.replication.clone())),
        };

        Self {
            listener,
            state: Arc::new(ServerState::new(role, config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to this node's local store.
    pub fn cache(&self) -> Cache {
        self.state.cache.clone()
    }

    /// Membership of this node when it is a leader.
    pub fn replicator(&self) -> Option<Replicator> {
        match &self.state.role {
            Role::Leader(replicator) => Some(replicator.clone()),
            Role::Follower(_) => None,
        }
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        let mut follower = match state.role {
            Role::Follower(leader) => Some(spawn_leader_follower(leader, &state)),
            Role::Leader(_) => None,
        };

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state, follower.take());
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &ServerState, follower: Option<JoinHandle<()>>) {
    info!("server shutting down");
    if let Some(follower) = follower {
        follower.abort();
    }
    if let Role::Leader(replicator) = &state.role {
        replicator.clear();
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    match run_session(&state, &mut reader, &mut writer, Origin::Client).await? {
        SessionEnd::Closed => debug!(peer = %peer, "connection closed"),
        SessionEnd::Joined => {
            // The connection now belongs to the membership set; this task is done with it.
            if let Role::Leader(replicator) = &state.role {
                replicator.add_member(peer, Client::from_parts(reader, writer));
            }
        }
    }

    Ok(())
}

/// Decodes and applies commands one frame at a time, writing each response
/// before reading the next frame.
async fn run_session<R, W>(
    state: &ServerState,
    reader: &mut R,
    writer: &mut W,
    origin: Origin,
) -> Result<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let command = match read_next_command(state, reader, origin).await? {
            Some(command) => command,
            None => return Ok(SessionEnd::Closed),
        };

        match command {
            Command::Join => match (&state.role, origin) {
                (Role::Leader(_), Origin::Client) => return Ok(SessionEnd::Joined),
                (Role::Follower(_), _) => bail!("join refused: this node is a follower"),
                (Role::Leader(_), Origin::Leader) => {
                    bail!("join received on a replication channel")
                }
            },
            command => {
                let response = apply(state, &command, origin);
                writer.write_all(&response.encode()).await?;
                writer.flush().await?;
            }
        }
    }
}

async fn read_next_command<R>(
    state: &ServerState,
    reader: &mut R,
    origin: Origin,
) -> Result<Option<Command>>
where
    R: AsyncRead + Unpin,
{
    let max_field_len = state.config.max_field_len;
    let idle_timeout = match origin {
        Origin::Client => state.config.idle_timeout,
        Origin::Leader => None,
    };

    let command = match idle_timeout {
        Some(limit) => time::timeout(limit, read_command(reader, max_field_len))
            .await
            .with_context(|| format!("no request within {limit:?}"))??,
        None => read_command(reader, max_field_len).await?,
    };

    Ok(command)
}

/// Applies a data command to the store and builds its response.
fn execute(cache: &Cache, command: &Command) -> Response {
    match command {
        Command::Get { key } => match cache.get(key) {
            Ok(value) => Response::Value {
                status: Status::Ok,
                value,
            },
            Err(err) => Response::Value {
                status: status_for(&err),
                value: Default::default(),
            },
        },
        Command::Set {
            key,
            value,
            ttl_seconds,
        } => match ttl_from_seconds(*ttl_seconds) {
            Ok(ttl) => {
                cache.set(key.clone(), value.clone(), ttl);
                Response::Status(Status::Ok)
            }
            Err(err) => {
                debug!(error = %err, "rejecting set");
                Response::Status(status_for(&err))
            }
        },
        Command::Delete { key } => {
            cache.delete(key);
            Response::Status(Status::Ok)
        }
        // Join never reaches the store; the session loop consumes it.
        Command::Join => Response::Status(Status::Error),
    }
}

fn status_for(err: &StoreError) -> Status {
    match err {
        StoreError::NotFound => Status::KeyNotFound,
        StoreError::InvalidTtl(_) => Status::Error,
    }
}

/// Runs `command` against the local store. On a leader, a successful client
/// mutation is queued for every member before the ordering lock is released, so
/// members receive writes in exactly the order the store applied them.
fn apply(state: &ServerState, command: &Command, origin: Origin) -> Response {
    let replicator = match (&state.role, origin) {
        (Role::Leader(replicator), Origin::Client) if command.is_mutation() => replicator,
        _ => return execute(&state.cache, command),
    };

    let _order = state.write_order.lock();
    let response = execute(&state.cache, command);
    if response.status() == Status::Ok {
        replicator.replicate(command);
    }
    response
}

fn spawn_leader_follower(leader: SocketAddr, state: &Arc<ServerState>) -> JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        loop {
            match follow_leader(leader, &state).await {
                Ok(()) => info!(leader = %leader, "leader closed replication channel"),
                Err(err) => warn!(leader = %leader, error = ?err, "replication channel failed"),
            }
            time::sleep(state.config.reconnect_delay).await;
        }
    })
}

/// Joins `leader` and applies everything it forwards until the channel ends.
async fn follow_leader(leader: SocketAddr, state: &ServerState) -> Result<()> {
    let stream = TcpStream::connect(leader)
        .await
        .with_context(|| format!("failed to connect to leader {leader}"))?;
    stream.set_nodelay(true)?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(&Command::Join.encode()).await?;
    writer.flush().await?;
    info!(leader = %leader, "joined leader");

    run_session(state, &mut reader, &mut writer, Origin::Leader).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn execute_maps_store_outcomes_to_statuses() {
        let cache = Cache::new();

        let missing = execute(&cache, &Command::Get { key: b("missing") });
        assert_eq!(
            missing,
            Response::Value {
                status: Status::KeyNotFound,
                value: Bytes::new()
            }
        );

        let set = Command::Set {
            key: b("foo"),
            value: b("bar"),
            ttl_seconds: 0,
        };
        assert_eq!(execute(&cache, &set), Response::Status(Status::Ok));
        assert_eq!(
            execute(&cache, &Command::Get { key: b("foo") }),
            Response::Value {
                status: Status::Ok,
                value: b("bar")
            }
        );

        assert_eq!(
            execute(&cache, &Command::Delete { key: b("foo") }),
            Response::Status(Status::Ok)
        );
        assert!(!cache.has(b"foo"));
    }

    #[tokio::test]
    async fn negative_ttl_is_an_error_status() {
        let cache = Cache::new();
        let set = Command::Set {
            key: b("foo"),
            value: b("bar"),
            ttl_seconds: -5,
        };
        assert_eq!(execute(&cache, &set), Response::Status(Status::Error));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn session_answers_in_request_order() {
        let state = ServerState::new(
            Role::Leader(Replicator::new(ReplicationConfig::default())),
            ServerConfig::default(),
        );

        let mut requests = Vec::new();
        requests.extend_from_slice(
            &Command::Set {
                key: b("k"),
                value: b("v"),
                ttl_seconds: 0,
            }
            .encode(),
        );
        requests.extend_from_slice(&Command::Get { key: b("k") }.encode());
        requests.extend_from_slice(&Command::Get { key: b("nope") }.encode());
        let mut reader: &[u8] = &requests;
        let mut written = Vec::new();

        let end = run_session(&state, &mut reader, &mut written, Origin::Client)
            .await
            .expect("session");
        assert!(matches!(end, SessionEnd::Closed));

        let mut expected = Vec::new();
        expected.extend_from_slice(&Response::Status(Status::Ok).encode());
        expected.extend_from_slice(
            &Response::Value {
                status: Status::Ok,
                value: b("v"),
            }
            .encode(),
        );
        expected.extend_from_slice(
            &Response::Value {
                status: Status::KeyNotFound,
                value: Bytes::new(),
            }
            .encode(),
        );
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn follower_refuses_join() {
        let state = ServerState::new(
            Role::Follower("127.0.0.1:1".parse().expect("addr")),
            ServerConfig::default(),
        );

        let join = Command::Join.encode();
        let mut reader: &[u8] = &join;
        let mut written = Vec::new();
        let result = run_session(&state, &mut reader, &mut written, Origin::Client).await;
        assert!(result.is_err());
        assert!(written.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn members_see_concurrent_writes_in_store_order() {
        const WRITERS: usize = 4;
        const WRITES: usize = 200;

        let replicator = Replicator::new(ReplicationConfig::default());
        let state = Arc::new(ServerState::new(
            Role::Leader(replicator.clone()),
            ServerConfig::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = Client::connect(addr).await.expect("connect");
        let (mut member, _) = listener.accept().await.expect("accept");
        replicator.add_member(addr, client);

        let sessions: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let mut requests = Vec::new();
                    for i in 0..WRITES {
                        let set = Command::Set {
                            key: b("k"),
                            value: b(&format!("{writer}-{i}")),
                            ttl_seconds: 0,
                        };
                        requests.extend_from_slice(&set.encode());
                    }
                    let mut reader: &[u8] = &requests;
                    let mut written = Vec::new();
                    run_session(&state, &mut reader, &mut written, Origin::Client)
                        .await
                        .expect("session");
                })
            })
            .collect();

        let mut last_forwarded = Bytes::new();
        for _ in 0..WRITERS * WRITES {
            let forwarded = read_command(&mut member, DEFAULT_MAX_FIELD_LEN)
                .await
                .expect("decode")
                .expect("frame");
            match forwarded {
                Command::Set { value, .. } => last_forwarded = value,
                other => panic!("unexpected forwarded command {other:?}"),
            }
            member
                .write_all(&Response::Status(Status::Ok).encode())
                .await
                .expect("ack");
        }
        for session in sessions {
            session.await.expect("session task");
        }

        assert_eq!(state.cache.get(b"k"), Ok(last_forwarded));
        assert_eq!(replicator.member_count(), 1);
    }
}
