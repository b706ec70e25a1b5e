use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    protocol::DEFAULT_MAX_FIELD_LEN, replication::ReplicationConfig, server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cache node. Without `--leader` the node is a leader.
    Serve(ServeArgs),
    /// Fetch a key and print its value.
    Get(GetArgs),
    /// Store a value under a key.
    Set(SetArgs),
    /// Remove a key.
    Delete(DeleteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the node should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Address of the leader to join. Makes this node a follower.
    #[arg(long)]
    pub leader: Option<SocketAddr>,

    /// Upper bound on one replication round trip to a follower.
    #[arg(long, default_value_t = 1000)]
    pub replication_timeout_ms: u64,

    /// Operations buffered per follower before it is dropped as lagging.
    #[arg(long, default_value_t = 1024)]
    pub member_queue: usize,

    /// Pause between attempts to reach the leader.
    #[arg(long, default_value_t = 1000)]
    pub reconnect_delay_ms: u64,

    /// Close client connections idle for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Largest key or value accepted on the wire, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FIELD_LEN)]
    pub max_field_bytes: usize,
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        ServerConfig {
            leader: args.leader,
            max_field_len: args.max_field_bytes,
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
            replication: ReplicationConfig {
                timeout: Duration::from_millis(args.replication_timeout_ms),
                queue_capacity: args.member_queue,
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    /// Address of the node to query.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,

    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    /// Address of the node to write to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,

    pub key: String,

    pub value: String,

    /// Seconds until the entry expires. 0 keeps it forever.
    #[arg(long, default_value_t = 0)]
    pub ttl: i32,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Address of the node to delete from.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,

    pub key: String,
}
