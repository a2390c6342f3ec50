//! Space replication over swarm connections
//!
//! Every connection in a space's swarm runs a [`ReplicationProtocol`]: each
//! peer signs the other's challenge with its device key and is checked
//! against the space's credentials. Admitted peers exchange the feeds they
//! hold, then run one [`FeedReplication`](crate::feed::FeedReplication)
//! session per feed both sides know about. Feeds admitted later join the
//! running connection.

mod messages;
mod protocol;

pub use messages::{challenge_digest, ReplicationMessage, CHALLENGE_SIZE};
pub use protocol::ReplicationProtocol;
