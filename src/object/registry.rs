//! The per-peer object store: master registration, the map/unmap handshake for slaves, and
//! the peer-local instance cache that lets late subscribers reuse snapshots that already
//! passed by on the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{ObjectError, ObjectResult};
use crate::object::command::{
    node_link, MapReply, MapRequest, NodeCommand, NodeLink, NodeLinkReceiver,
};
use crate::object::istream::VersionInStream;
use crate::object::master::{DeltaMasterCm, FullMasterCm};
use crate::object::object::{ChangeKind, Distributed};
use crate::object::slave::SlaveCm;
use crate::object::stream::{CommandKind, ObjectDataCommand};
use crate::object::version::{InstanceId, ObjectId, Version, INSTANCE_ALL};

/// A registered master object's change manager.
#[derive(Clone)]
pub enum MasterHandle {
    Full(Arc<FullMasterCm>),
    Delta(Arc<DeltaMasterCm>),
}

impl MasterHandle {
    fn cm(&self) -> &FullMasterCm {
        match self {
            MasterHandle::Full(cm) => cm,
            MasterHandle::Delta(cm) => cm.inner(),
        }
    }

    pub fn version(&self) -> Version {
        self.cm().version()
    }

    pub fn set_auto_obsolete(&self, count: u64) {
        self.cm().set_auto_obsolete(count);
    }

    pub fn commit<T: Distributed>(&self, object: &mut T, incarnation: u64) -> Version {
        match self {
            MasterHandle::Full(cm) => cm.commit(object, incarnation),
            MasterHandle::Delta(cm) => cm.commit(object, incarnation),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.cm().subscriber_count()
    }
}

/// Peer-local cache of instance snapshots observed on the wire, keyed by object. Mapping a
/// slave consults it so the master can skip streaming versions the peer already holds.
pub struct InstanceCache {
    max_bytes: usize,
    state: Mutex<CacheState>,
}

struct CacheState {
    total_bytes: usize,
    streams: FxHashMap<ObjectId, VecDeque<VersionInStream>>,
    in_progress: FxHashMap<ObjectId, VersionInStream>,
}

impl InstanceCache {
    pub fn new(max_bytes: usize) -> InstanceCache {
        InstanceCache {
            max_bytes,
            state: Mutex::new(CacheState {
                total_bytes: 0,
                streams: FxHashMap::default(),
                in_progress: FxHashMap::default(),
            }),
        }
    }

    /// Offers a broadcast instance fragment to the cache.
    pub fn add_command(&self, command: &ObjectDataCommand) {
        if command.kind != CommandKind::Instance || command.instance_id != INSTANCE_ALL {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let object_id = command.object_id;

        let assembling = state.in_progress.remove(&object_id);
        let stream = match assembling {
            // a new version starting over an incomplete one supersedes it - the cache
            // only ever observed part of the older version
            Some(mut stream)
                if !(command.sequence == 0 && command.version != stream.version()) =>
            {
                stream.add_command(command.clone());
                stream
            }
            _ => {
                if command.sequence != 0 {
                    return; // joined mid-stream, cannot assemble this version
                }
                VersionInStream::new(command.clone())
            }
        };

        if stream.is_ready() {
            Self::promote(&mut state, object_id, stream);
            self.evict(&mut state);
        } else {
            state.in_progress.insert(object_id, stream);
        }
    }

    fn promote(state: &mut CacheState, object_id: ObjectId, stream: VersionInStream) {
        let deque = state.streams.entry(object_id).or_default();
        if let Some(back) = deque.back() {
            if back.version().next() != stream.version() {
                // a gap: the cached run is stale, restart with the new version
                let dropped: usize = deque.iter().map(|s| s.data_size()).sum();
                state.total_bytes -= dropped;
                deque.clear();
            }
        }
        state.total_bytes += stream.data_size();
        trace!("caching {} v{}", object_id, stream.version());
        deque.push_back(stream);
    }

    fn evict(&self, state: &mut CacheState) {
        while state.total_bytes > self.max_bytes {
            let Some((&victim, _)) = state
                .streams
                .iter()
                .filter(|(_, deque)| !deque.is_empty())
                .max_by_key(|(_, deque)| deque.len())
            else {
                break;
            };
            let deque = state.streams.get_mut(&victim).unwrap();
            if let Some(stream) = deque.pop_front() {
                state.total_bytes -= stream.data_size();
                debug!("evicting cached {} v{}", victim, stream.version());
            }
        }
    }

    /// The ready cached streams for one object, oldest first.
    pub fn streams_for(&self, object_id: ObjectId) -> Vec<VersionInStream> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(&object_id)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One peer's view of the distributed objects: its registered masters, its mapped slaves
/// and its instance cache. Inbound node commands are drained by [`serve`](ObjectStore::serve)
/// or dispatched one by one through [`handle_command`](ObjectStore::handle_command).
pub struct ObjectStore {
    config: Arc<Config>,
    next_instance_id: AtomicU32,
    self_link: NodeLink,
    masters: Mutex<FxHashMap<ObjectId, MasterHandle>>,
    slaves: Mutex<FxHashMap<(ObjectId, InstanceId), Arc<SlaveCm>>>,
    cache: InstanceCache,
}

impl ObjectStore {
    pub fn new(config: Config) -> (Arc<ObjectStore>, NodeLinkReceiver) {
        let config = Arc::new(config);
        let (self_link, receiver) = node_link(&config);
        let store = Arc::new(ObjectStore {
            next_instance_id: AtomicU32::new(0),
            self_link,
            masters: Mutex::new(FxHashMap::default()),
            slaves: Mutex::new(FxHashMap::default()),
            cache: InstanceCache::new(config.object_buffer_size * 16),
            config,
        });
        (store, receiver)
    }

    /// The link other peers use to reach this store.
    pub fn link(&self) -> NodeLink {
        self.self_link.clone()
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    /// Drains inbound commands until all links to this store are gone.
    pub fn serve(&self, receiver: NodeLinkReceiver) {
        while let Some(command) = receiver.recv() {
            self.handle_command(command);
        }
        debug!("object store serve loop ending");
    }

    fn alloc_instance_id(&self) -> InstanceId {
        self.next_instance_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a master object: assigns its cluster-wide id, creates the change manager
    /// matching its change kind and produces `VERSION_FIRST`.
    pub fn register_master<T: Distributed>(&self, object: &T) -> (ObjectId, MasterHandle) {
        let object_id = ObjectId::new_v4();
        let master_instance_id = self.alloc_instance_id();

        let handle = match object.change_kind() {
            ChangeKind::Full => {
                let cm = FullMasterCm::new(self.config.clone(), object_id, master_instance_id);
                cm.init(object);
                MasterHandle::Full(Arc::new(cm))
            }
            ChangeKind::Delta => {
                let cm = DeltaMasterCm::new(self.config.clone(), object_id, master_instance_id);
                cm.init(object);
                MasterHandle::Delta(Arc::new(cm))
            }
        };

        debug!("registered master {} as {:?}", object_id, object.change_kind());
        self.masters
            .lock()
            .unwrap()
            .insert(object_id, handle.clone());
        (object_id, handle)
    }

    pub fn deregister_master(&self, object_id: ObjectId) {
        self.masters.lock().unwrap().remove(&object_id);
    }

    pub fn master(&self, object_id: ObjectId) -> Option<MasterHandle> {
        self.masters.lock().unwrap().get(&object_id).cloned()
    }

    /// Subscribes `object` as a slave of a remote master: performs the map handshake,
    /// merges locally cached snapshots, and applies the initial instance data.
    pub fn map_object<T: Distributed>(
        &self,
        object: &mut T,
        object_id: ObjectId,
        master: NodeLink,
        requested: Version,
    ) -> ObjectResult<Arc<SlaveCm>> {
        let instance_id = self.alloc_instance_id();
        let cm = Arc::new(SlaveCm::new(
            self.config.clone(),
            object_id,
            instance_id,
            master.clone(),
            object.max_versions(),
        ));
        self.slaves
            .lock()
            .unwrap()
            .insert((object_id, instance_id), cm.clone());

        let cached = self.cache.streams_for(object_id);
        let (min_cached, max_cached) = match (cached.first(), cached.last()) {
            (Some(first), Some(last)) => (first.version(), last.version()),
            _ => (Version::NONE, Version::NONE),
        };

        let delivered = master.send(NodeCommand::Map(MapRequest {
            object_id,
            requested_version: requested,
            min_cached_version: min_cached,
            max_cached_version: max_cached,
            use_cache: !cached.is_empty(),
            instance_id,
            reply: self.self_link.clone(),
        }));
        if !delivered {
            self.slaves.lock().unwrap().remove(&(object_id, instance_id));
            return Err(ObjectError::MasterUnreachable);
        }

        let reply = match cm.wait_map_reply(self.config.default_timeout) {
            Ok(reply) => reply,
            Err(e) => {
                self.slaves.lock().unwrap().remove(&(object_id, instance_id));
                return Err(e);
            }
        };
        if !reply.result {
            self.slaves.lock().unwrap().remove(&(object_id, instance_id));
            return Err(ObjectError::MapFailed {
                requested: requested.0,
                head: reply.version.0,
            });
        }

        if reply.use_cache && !cached.is_empty() {
            cm.add_instance_datas(&cached, reply.version);
        }
        cm.apply_map_data(object, reply.version)?;

        debug!(
            "mapped {} as instance {} at v{}",
            object_id,
            instance_id,
            cm.version()
        );
        Ok(cm)
    }

    /// Unsubscribes a slave from its master.
    pub fn unmap_object(&self, cm: &Arc<SlaveCm>) {
        self.slaves
            .lock()
            .unwrap()
            .remove(&(cm.object_id(), cm.instance_id()));
        cm.master_link().send(NodeCommand::Unmap {
            object_id: cm.object_id(),
            instance_id: cm.instance_id(),
        });
    }

    pub fn handle_command(&self, command: NodeCommand) {
        match command {
            NodeCommand::ObjectData(data) => {
                self.cache.add_command(&data);

                let slaves = self.slaves.lock().unwrap();
                for ((object_id, instance_id), cm) in slaves.iter() {
                    if *object_id != data.object_id {
                        continue;
                    }
                    if data.instance_id == INSTANCE_ALL || data.instance_id == *instance_id {
                        cm.handle_command(data.clone());
                    }
                }
            }
            NodeCommand::Map(request) => match self.master(request.object_id) {
                Some(handle) => match &handle {
                    MasterHandle::Full(cm) => cm.handle_map(request),
                    MasterHandle::Delta(cm) => cm.handle_map(request),
                },
                None => {
                    warn!("map request for unknown master {}", request.object_id);
                    request.reply.send(NodeCommand::MapReply(MapReply {
                        object_id: request.object_id,
                        instance_id: request.instance_id,
                        version: Version::NONE,
                        result: false,
                        use_cache: false,
                    }));
                }
            },
            NodeCommand::MapSuccess {
                object_id,
                instance_id,
                master_instance_id,
            } => {
                if let Some(cm) = self.slave(object_id, instance_id) {
                    cm.set_master_instance_id(master_instance_id);
                }
            }
            NodeCommand::MapReply(reply) => {
                if let Some(cm) = self.slave(reply.object_id, reply.instance_id) {
                    cm.note_map_reply(reply);
                }
            }
            NodeCommand::Unmap {
                object_id,
                instance_id,
            } => {
                if let Some(handle) = self.master(object_id) {
                    handle.cm().unsubscribe(instance_id);
                }
            }
            NodeCommand::Sync(request) => {
                if let Some(handle) = self.master(request.object_id) {
                    handle.cm().handle_sync(request);
                }
            }
            NodeCommand::SyncReply { object_id, .. } => {
                trace!("sync reply for {}", object_id);
            }
            NodeCommand::MaxVersion {
                object_id,
                max_version,
            } => {
                if let Some(handle) = self.master(object_id) {
                    handle.cm().note_max_version(max_version);
                }
            }
            NodeCommand::SlaveCommit(commit) => match self.master(commit.object_id) {
                Some(handle) => handle.cm().queue_slave_commit(commit),
                None => warn!("slave commit for unknown master {}", commit.object_id),
            },
        }
    }

    fn slave(&self, object_id: ObjectId, instance_id: InstanceId) -> Option<Arc<SlaveCm>> {
        self.slaves
            .lock()
            .unwrap()
            .get(&(object_id, instance_id))
            .cloned()
    }
}
