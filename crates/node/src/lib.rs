/**
 * Node configuration, loaded from and
 *  saved to `config.toml`.
 */
pub mod config;
pub mod error;
/**
 * Subscriber setup for binaries and harnesses
 *  embedding a node.
 */
pub mod logging;
/**
 * The spaces and secrets a node remembers
 *  across restarts.
 */
pub mod metadata;
/**
 * The explicit node context: identity, spaces,
 *  swarms and invitations of one device.
 */
pub mod node;
/**
 * In-process multi-node harness over the
 *  in-memory network.
 */
pub mod testkit;

pub use config::{ConfigError, NodeConfig};
pub use error::NodeError;
pub use logging::init_logging;
pub use node::{NetworkProvider, Node, PendingJoin};

pub mod prelude {
    pub use crate::config::NodeConfig;
    pub use crate::error::NodeError;
    pub use crate::logging::init_logging;
    pub use crate::node::{Node, PendingJoin};
    pub use common::prelude::*;
}
