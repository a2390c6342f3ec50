/**
 * Stable binary encoding shared by blocks,
 *  credentials and wire messages.
 */
pub mod codec;
/**
 * Cryptographic types and operations.
 *  - Public and Private key implementations
 *  - Keyring holding the secrets a node signs with
 *  - Passcodes for shared-secret invitations
 */
pub mod crypto;
/**
 * Random-access byte storage that feeds are
 *  written to, in memory or on disk.
 */
pub mod storage;
/**
 * Signed, hash-chained append-only logs and
 *  the block exchange that replicates them.
 */
pub mod feed;
/**
 * Registry of open feeds, one handle per key.
 */
pub mod feed_store;
/**
 * Vector clock over feeds.
 */
pub mod timeframe;
/**
 * Signed assertions, credential chains and the
 *  identity / space state machines they drive.
 */
pub mod credentials;
/**
 * A space: the feeds admitted to it, merged in
 *  causal order into one object model.
 */
pub mod space;
/**
 * Swarms of peers on a topic, over an
 *  in-memory network or Iroh QUIC streams.
 */
pub mod network;
/**
 * Replication of a space's feeds between the
 *  peers of its swarm.
 */
pub mod replication;
/**
 * Short-lived authenticated handshakes that
 *  admit a new member or device.
 */
pub mod invitation;

pub mod prelude {
    pub use crate::credentials::{Credential, SpaceRole};
    pub use crate::crypto::{Keyring, PublicKey, SecretKey};
    pub use crate::feed::Feed;
    pub use crate::feed_store::FeedStore;
    pub use crate::invitation::{Invitation, InvitationHandle, InvitationState};
    pub use crate::network::{NetworkManager, Topology};
    pub use crate::space::{Mutation, Space, SpaceContext, SpaceEvent, Value};
    pub use crate::timeframe::Timeframe;
}
