//! Node-level commands exchanged between peers' object stores, and the bounded links they
//! travel over.
//!
//! This is the boundary towards the command dispatcher: object stores hand each other typed
//! commands through [`NodeLink`]s. In-process links are backed by bounded channels whose
//! capacity is the configured command queue limit, so a slow receiver back-pressures its
//! senders. Object data commands have a defined wire encoding (see
//! [`ObjectDataCommand`]); pumping a link over a network connection is the dispatcher's
//! concern and out of scope here.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::warn;

use crate::config::Config;
use crate::object::stream::{CommandSink, ObjectDataCommand};
use crate::object::version::{InstanceId, ObjectId, Version};

/// A slave's request to subscribe to a master object.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub object_id: ObjectId,
    pub requested_version: Version,
    /// Oldest version the requester holds in its local instance cache.
    pub min_cached_version: Version,
    /// Newest version the requester holds in its local instance cache.
    pub max_cached_version: Version,
    pub use_cache: bool,
    /// The requesting slave's instance id; map data is addressed to it.
    pub instance_id: InstanceId,
    /// Where map traffic and later commit broadcasts for this subscriber go.
    pub reply: NodeLink,
}

/// Completes the map handshake after the initial instance data has been streamed.
#[derive(Debug, Clone, Copy)]
pub struct MapReply {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    /// First version the subscriber will observe.
    pub version: Version,
    pub result: bool,
    /// Whether the master honored the requester's cached range.
    pub use_cache: bool,
}

/// A slave's request for the master's current instance data (cache validation).
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    /// Master instance the requester believes it is attached to.
    pub master_instance_id: InstanceId,
    pub use_cache: bool,
    pub max_cached_version: Version,
    pub reply: NodeLink,
}

/// A delta committed on a slave, to be applied by the master on its next commit. The
/// assigned version travels back through `reply`.
#[derive(Debug, Clone)]
pub struct SlaveCommit {
    pub object_id: ObjectId,
    pub commands: Vec<ObjectDataCommand>,
    pub reply: Sender<Version>,
}

#[derive(Debug, Clone)]
pub enum NodeCommand {
    ObjectData(ObjectDataCommand),
    Map(MapRequest),
    MapSuccess {
        object_id: ObjectId,
        instance_id: InstanceId,
        master_instance_id: InstanceId,
    },
    MapReply(MapReply),
    Unmap {
        object_id: ObjectId,
        instance_id: InstanceId,
    },
    Sync(SyncRequest),
    SyncReply {
        object_id: ObjectId,
        result: bool,
        use_cache: bool,
    },
    /// Advances the master's commit window after a slave applied a version.
    MaxVersion {
        object_id: ObjectId,
        max_version: u64,
    },
    SlaveCommit(SlaveCommit),
}

/// Sending half of a node link.
#[derive(Debug, Clone)]
pub struct NodeLink {
    tx: Sender<NodeCommand>,
}

impl NodeLink {
    /// Delivers a command, blocking when the receiver's queue is at the configured limit.
    /// Returns false if the receiving node is gone.
    pub fn send(&self, command: NodeCommand) -> bool {
        if self.tx.send(command).is_err() {
            warn!("dropping command for a disconnected node");
            return false;
        }
        true
    }
}

impl CommandSink for NodeLink {
    fn send_command(&self, command: ObjectDataCommand) {
        self.send(NodeCommand::ObjectData(command));
    }
}

/// Receiving half of a node link, drained by the owning store's serve loop.
#[derive(Debug)]
pub struct NodeLinkReceiver {
    rx: Receiver<NodeCommand>,
}

impl NodeLinkReceiver {
    pub fn recv(&self) -> Option<NodeCommand> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<NodeCommand> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<NodeCommand, bool> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => true,
            RecvTimeoutError::Disconnected => false,
        })
    }
}

/// Creates an in-process node link with the configured command queue limit.
pub fn node_link(config: &Config) -> (NodeLink, NodeLinkReceiver) {
    let (tx, rx) = bounded(config.command_queue_limit);
    (NodeLink { tx }, NodeLinkReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_round_trip() {
        let (link, rx) = node_link(&Config::default());
        assert!(link.send(NodeCommand::MaxVersion {
            object_id: ObjectId::from_u128(1),
            max_version: 42,
        }));

        match rx.recv().unwrap() {
            NodeCommand::MaxVersion { max_version, .. } => assert_eq!(max_version, 42),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_send_to_dropped_receiver_reports_failure() {
        let (link, rx) = node_link(&Config::default());
        drop(rx);
        assert!(!link.send(NodeCommand::Unmap {
            object_id: ObjectId::from_u128(1),
            instance_id: 0,
        }));
    }
}
