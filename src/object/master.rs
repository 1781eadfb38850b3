//! Master-side change managers: versioned commit production, the bounded ring of retained
//! snapshots, and initial sync for new subscribers.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::object::command::{MapRequest, MapReply, NodeCommand, NodeLink, SlaveCommit, SyncRequest};
use crate::object::object::Distributed;
use crate::object::stream::{CommandKind, CommandSink, DataIStream, DataOStream, ObjectDataCommand};
use crate::object::version::{InstanceId, ObjectId, Version};

/// Incarnation sentinel: advance the commit count by one.
pub const COMMIT_NEXT: u64 = u64::MAX;

/// One retained version: its serialized snapshot as framed commands, and the commit count
/// at which it was produced (the obsoletion key).
struct InstanceEntry {
    version: Version,
    commit_count: u64,
    commands: Vec<ObjectDataCommand>,
}

struct Subscriber {
    instance_id: InstanceId,
    link: NodeLink,
}

struct MasterState {
    version: Version,
    commit_count: u64,
    /// Auto-obsolete count: at most `n_versions + 1` entries survive.
    n_versions: u64,
    entries: VecDeque<InstanceEntry>,
    /// Released command vectors, reused instead of deallocated.
    free_commands: Vec<Vec<ObjectDataCommand>>,
    subscribers: Vec<Subscriber>,
    pending_slave_commits: Vec<SlaveCommit>,
    pending_slave_replies: Vec<crossbeam::channel::Sender<Version>>,
}

impl MasterState {
    fn subscriber_sinks(&self) -> Vec<Arc<dyn CommandSink>> {
        self.subscribers
            .iter()
            .map(|s| Arc::new(s.link.clone()) as Arc<dyn CommandSink>)
            .collect()
    }

    fn push_entry(&mut self, version: Version, commands: Vec<ObjectDataCommand>) {
        debug_assert!(version.is_concrete());
        self.entries.push_back(InstanceEntry {
            version,
            commit_count: self.commit_count,
            commands,
        });
    }

    fn release_entry(&mut self, entry: InstanceEntry) {
        let mut commands = entry.commands;
        commands.clear();
        self.free_commands.push(commands);
    }

    fn check_consistency(&self) {
        #[cfg(debug_assertions)]
        {
            assert!(!self.entries.is_empty() || self.version == Version::NONE);
            let mut expected = self.version;
            for entry in self.entries.iter().rev() {
                assert_eq!(entry.version, expected);
                expected = Version(expected.0 - 1);
            }
        }
    }
}

/// Change manager for a master object that sends a full instance snapshot on every commit.
pub struct FullMasterCm {
    config: Arc<Config>,
    object_id: ObjectId,
    master_instance_id: InstanceId,
    state: Mutex<MasterState>,
    /// Highest version the slowest bounded slave allows; commits block until the next
    /// version is below this.
    max_version: Mutex<u64>,
    max_version_cv: Condvar,
}

impl FullMasterCm {
    pub fn new(
        config: Arc<Config>,
        object_id: ObjectId,
        master_instance_id: InstanceId,
    ) -> FullMasterCm {
        FullMasterCm {
            config,
            object_id,
            master_instance_id,
            state: Mutex::new(MasterState {
                version: Version::NONE,
                commit_count: 0,
                n_versions: 0,
                entries: VecDeque::new(),
                free_commands: Vec::new(),
                subscribers: Vec::new(),
                pending_slave_commits: Vec::new(),
                pending_slave_replies: Vec::new(),
            }),
            max_version: Mutex::new(u64::MAX),
            max_version_cv: Condvar::new(),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn master_instance_id(&self) -> InstanceId {
        self.master_instance_id
    }

    pub fn version(&self) -> Version {
        self.state.lock().unwrap().version
    }

    /// Number of retained versions, for introspection and tests.
    pub fn retained_versions(&self) -> Vec<Version> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.version)
            .collect()
    }

    /// Produces `VERSION_FIRST` from the object's instance data.
    pub fn init<T: Distributed>(&self, object: &T) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.version, Version::NONE);

        let commands = self.pack_instance(&mut state, object, Version::FIRST, true);
        state.version = Version::FIRST;
        state.push_entry(Version::FIRST, commands);
        state.commit_count += 1;
        state.check_consistency();
    }

    /// Serializes the instance snapshot for `version`, broadcasting it to the current
    /// subscribers if `broadcast`, and returns the retained command copy.
    fn pack_instance<T: Distributed>(
        &self,
        state: &mut MasterState,
        object: &T,
        version: Version,
        broadcast: bool,
    ) -> Vec<ObjectDataCommand> {
        let sinks = if broadcast {
            state.subscriber_sinks()
        } else {
            Vec::new()
        };
        let recycled = state.free_commands.pop().unwrap_or_default();
        let mut os = DataOStream::enable(
            &self.config,
            CommandKind::Instance,
            self.object_id,
            self.master_instance_id,
            version,
            sinks,
        )
        .save_into(recycled);
        object.get_instance_data(&mut os);
        os.disable();
        os.take_saved()
    }

    pub fn set_auto_obsolete(&self, count: u64) {
        let mut state = self.state.lock().unwrap();
        state.n_versions = count;
        Self::obsolete(&mut state);
    }

    pub fn auto_obsolete_count(&self) -> u64 {
        self.state.lock().unwrap().n_versions
    }

    /// Commits the object, returning the resulting head version. A clean object only
    /// advances the incarnation bookkeeping.
    pub fn commit<T: Distributed>(&self, object: &mut T, incarnation: u64) -> Version {
        self.apply_pending_slave_commits(object);

        if !object.is_dirty() {
            let mut state = self.state.lock().unwrap();
            Self::update_commit_count(&mut state, incarnation);
            Self::obsolete(&mut state);
            self.reply_slave_commits(&mut state);
            return state.version;
        }

        self.wait_committable();

        let mut state = self.state.lock().unwrap();
        Self::update_commit_count(&mut state, incarnation);
        let next = state.version.next();
        let commands = self.pack_instance(&mut state, object, next, true);
        if !commands.is_empty() {
            state.version = next;
            state.push_entry(next, commands);
            trace!("committed {} v{}", self.object_id, next);
        }
        Self::obsolete(&mut state);
        state.check_consistency();
        self.reply_slave_commits(&mut state);
        state.version
    }

    /// Blocks until the bounded-slave window admits the next version.
    fn wait_committable(&self) {
        let next = self.state.lock().unwrap().version.low() + 1;
        let mut max = self.max_version.lock().unwrap();
        while *max < next {
            debug!("commit of {} waiting for slow slaves", self.object_id);
            max = self.max_version_cv.wait(max).unwrap();
        }
    }

    pub fn note_max_version(&self, max_version: u64) {
        *self.max_version.lock().unwrap() = max_version;
        self.max_version_cv.notify_all();
    }

    fn apply_pending_slave_commits<T: Distributed>(&self, object: &mut T) {
        let pending: Vec<SlaveCommit> =
            std::mem::take(&mut self.state.lock().unwrap().pending_slave_commits);
        if pending.is_empty() {
            return;
        }
        for commit in pending {
            let mut is = DataIStream::new(Version::NONE, CommandKind::Delta, commit.commands.into());
            if let Err(e) = object.unpack(&mut is).and_then(|_| is.assert_consumed()) {
                warn!("failed to apply slave delta for {}: {}", self.object_id, e);
            }
            // replied once the commit completes
            self.state
                .lock()
                .unwrap()
                .pending_slave_replies
                .push(commit.reply);
        }
    }

    fn reply_slave_commits(&self, state: &mut MasterState) {
        let version = state.version;
        for reply in state.pending_slave_replies.drain(..) {
            let _ = reply.send(version);
        }
    }

    pub fn queue_slave_commit(&self, commit: SlaveCommit) {
        self.state.lock().unwrap().pending_slave_commits.push(commit);
    }

    fn update_commit_count(state: &mut MasterState, incarnation: u64) {
        debug_assert!(!state.entries.is_empty());
        if incarnation == COMMIT_NEXT {
            state.commit_count += 1;
            return;
        }
        if incarnation >= state.commit_count {
            state.commit_count = incarnation;
            return;
        }

        // the caller rewound its incarnation: retained entries from the speculative future
        // are dropped
        warn!(
            "commit incarnation decreased from {} to {}",
            state.commit_count, incarnation
        );
        state.commit_count = incarnation;
        while state.entries.len() > 1 {
            let last = state.entries.back().unwrap();
            if last.commit_count <= state.commit_count {
                break;
            }
            let entry = state.entries.pop_back().unwrap();
            state.release_entry(entry);
        }

        let commit_count = state.commit_count;
        let back = state.entries.back_mut().unwrap();
        if back.commit_count > commit_count {
            // keep the minimum retained version alive regardless of obsoletion
            back.commit_count = 0;
        }
        state.version = state.entries.back().unwrap().version;
    }

    fn obsolete(state: &mut MasterState) {
        debug_assert!(!state.entries.is_empty());
        while state.entries.len() > 1 && state.commit_count > state.n_versions {
            let front = state.entries.front().unwrap();
            if front.commit_count >= state.commit_count - state.n_versions {
                break;
            }
            let entry = state.entries.pop_front().unwrap();
            state.release_entry(entry);
        }
    }

    /// Initial sync for a new subscriber: clamp the requested version to the retained
    /// range, skip what the subscriber already caches, stream the rest and complete with a
    /// map reply.
    pub fn handle_map(&self, request: MapRequest) {
        let mut state = self.state.lock().unwrap();
        state.check_consistency();

        let oldest = state.entries.front().map(|e| e.version).unwrap_or(Version::NONE);
        let head = state.version;

        let requested = request.requested_version;
        if requested.is_concrete() && requested > head {
            debug!(
                "cannot map {} at v{}: head is v{}",
                self.object_id, requested, head
            );
            request.reply.send(NodeCommand::MapReply(MapReply {
                object_id: self.object_id,
                instance_id: request.instance_id,
                version: head,
                result: false,
                use_cache: false,
            }));
            return;
        }

        let mut start = match requested {
            Version::OLDEST => oldest,
            v if v.is_concrete() && v < oldest => oldest,
            v if v.is_concrete() => v,
            _ => head,
        };
        let mut end = head;
        let reply_version = start;

        // skip the intersection with the subscriber's cached range
        let use_cache = request.use_cache;
        if use_cache {
            if request.min_cached_version <= start && request.max_cached_version >= start {
                start = request.max_cached_version.next();
            } else if request.max_cached_version == end {
                end = std::cmp::max(start, Version(request.min_cached_version.0.saturating_sub(1)));
            }
        }

        // register before streaming so no commit falls between initial sync and the
        // subscription
        state.subscribers.push(Subscriber {
            instance_id: request.instance_id,
            link: request.reply.clone(),
        });

        request.reply.send(NodeCommand::MapSuccess {
            object_id: self.object_id,
            instance_id: request.instance_id,
            master_instance_id: self.master_instance_id,
        });

        let mut data_sent = false;
        for entry in &state.entries {
            if entry.version < start || entry.version > end {
                continue;
            }
            data_sent = true;
            for command in &entry.commands {
                request.reply.send(NodeCommand::ObjectData(
                    command.retargeted(CommandKind::InstanceMap, request.instance_id),
                ));
            }
        }
        debug!(
            "mapped {} for instance {} at v{} ({} data)",
            self.object_id,
            request.instance_id,
            reply_version,
            if data_sent { "with" } else { "without" }
        );

        request.reply.send(NodeCommand::MapReply(MapReply {
            object_id: self.object_id,
            instance_id: request.instance_id,
            version: reply_version,
            result: true,
            use_cache,
        }));
    }

    pub fn unsubscribe(&self, instance_id: InstanceId) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|s| s.instance_id != instance_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    /// A slave validates its cached head: if it matches, no data flows; otherwise the
    /// latest retained snapshot is streamed back.
    pub fn handle_sync(&self, request: SyncRequest) {
        let state = self.state.lock().unwrap();

        let use_cache = request.use_cache
            && request.master_instance_id == self.master_instance_id
            && request.max_cached_version == state.version;

        if !use_cache {
            if let Some(entry) = state.entries.back() {
                for command in &entry.commands {
                    request.reply.send(NodeCommand::ObjectData(
                        command.retargeted(CommandKind::InstanceMap, request.instance_id),
                    ));
                }
            }
        }

        request.reply.send(NodeCommand::SyncReply {
            object_id: self.object_id,
            result: true,
            use_cache,
        });
    }
}

/// Change manager sending deltas between commits, while still retaining a full snapshot per
/// version so late subscribers need no delta replay.
pub struct DeltaMasterCm {
    full: FullMasterCm,
}

impl DeltaMasterCm {
    pub fn new(
        config: Arc<Config>,
        object_id: ObjectId,
        master_instance_id: InstanceId,
    ) -> DeltaMasterCm {
        DeltaMasterCm {
            full: FullMasterCm::new(config, object_id, master_instance_id),
        }
    }

    pub fn inner(&self) -> &FullMasterCm {
        &self.full
    }

    pub fn init<T: Distributed>(&self, object: &T) {
        self.full.init(object);
    }

    pub fn version(&self) -> Version {
        self.full.version()
    }

    pub fn set_auto_obsolete(&self, count: u64) {
        self.full.set_auto_obsolete(count);
    }

    pub fn handle_map(&self, request: MapRequest) {
        self.full.handle_map(request);
    }

    pub fn commit<T: Distributed>(&self, object: &mut T, incarnation: u64) -> Version {
        self.full.apply_pending_slave_commits(object);

        if !object.is_dirty() {
            let mut state = self.full.state.lock().unwrap();
            FullMasterCm::update_commit_count(&mut state, incarnation);
            FullMasterCm::obsolete(&mut state);
            self.full.reply_slave_commits(&mut state);
            return state.version;
        }

        self.full.wait_committable();

        let mut state = self.full.state.lock().unwrap();
        FullMasterCm::update_commit_count(&mut state, incarnation);
        let next = state.version.next();

        // the delta goes out first; whether it carried any bytes decides if this commit
        // produces a version at all
        let mut delta_sent = false;
        if !state.subscribers.is_empty() {
            let mut os = DataOStream::enable(
                &self.full.config,
                CommandKind::Delta,
                self.full.object_id,
                self.full.master_instance_id,
                next,
                state.subscriber_sinks(),
            );
            object.pack(&mut os);
            os.disable();
            delta_sent = os.has_sent_data();
        }

        if state.subscribers.is_empty() || delta_sent {
            let commands = self.full.pack_instance(&mut state, object, next, false);
            if delta_sent || !commands.is_empty() {
                state.version = next;
                state.push_entry(next, commands);
                trace!("committed {} v{} (delta)", self.full.object_id, next);
            }
        }

        FullMasterCm::obsolete(&mut state);
        state.check_consistency();
        self.full.reply_slave_commits(&mut state);
        state.version
    }
}
