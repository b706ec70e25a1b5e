//! Replicated in-memory key-value cache served over a binary TCP protocol.
//!
//! A node is either a leader, which accepts writes and forwards them to every
//! joined follower, or a follower, which joins a leader and applies what it
//! receives. Each module focuses on a concrete responsibility:
//!
//! - [`store`] holds entries behind a reader/writer lock and expires them with
//!   a single background purge task.
//! - [`protocol`] encodes and decodes the little-endian, length-prefixed frames.
//! - [`server`] accepts connections, applies commands in order, and runs the
//!   follower side of replication.
//! - [`replication`] tracks joined followers on a leader and fans out writes.
//! - [`client`] issues requests over one connection; the leader also uses it to
//!   talk to its followers.
//! - [`cli`] parses the command-line interface for node and client modes.
//!
//! Replication is best-effort and at-most-once. A follower sees a leader's
//! writes in the order the leader accepted them, but the leader never waits for
//! followers before answering its own clients.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod store;
