//! Slave-side change manager: reassembles inbound version streams and applies them to the
//! local object in strictly increasing version order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{ObjectError, ObjectResult};
use crate::object::command::{MapReply, NodeCommand, NodeLink, SlaveCommit};
use crate::object::istream::VersionInStream;
use crate::object::object::Distributed;
use crate::object::stream::{CommandKind, DataOStream, ObjectDataCommand};
use crate::object::version::{InstanceId, ObjectId, Version, INSTANCE_ALL};

struct SlaveState {
    version: Version,
    /// The stream currently being reassembled.
    current: Option<VersionInStream>,
    /// Ready streams awaiting apply, in version order.
    queue: VecDeque<VersionInStream>,
    /// Parked map reply, consumed by the thread driving the map handshake.
    map_reply: Option<MapReply>,
}

/// Change manager of one slave instance of an object.
pub struct SlaveCm {
    config: Arc<Config>,
    object_id: ObjectId,
    instance_id: InstanceId,
    /// Learned from the map handshake.
    master_instance_id: AtomicU32,
    master: NodeLink,
    /// The object's bound on buffered versions, captured at map time.
    max_versions: u64,
    state: Mutex<SlaveState>,
    ready_cv: Condvar,
}

impl SlaveCm {
    pub fn new(
        config: Arc<Config>,
        object_id: ObjectId,
        instance_id: InstanceId,
        master: NodeLink,
        max_versions: u64,
    ) -> SlaveCm {
        SlaveCm {
            config,
            object_id,
            instance_id,
            master_instance_id: AtomicU32::new(INSTANCE_ALL),
            master,
            max_versions,
            state: Mutex::new(SlaveState {
                version: Version::NONE,
                current: None,
                queue: VecDeque::new(),
                map_reply: None,
            }),
            ready_cv: Condvar::new(),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn master_instance_id(&self) -> InstanceId {
        self.master_instance_id.load(Ordering::Relaxed)
    }

    pub fn master_link(&self) -> &NodeLink {
        &self.master
    }

    pub fn set_master_instance_id(&self, master_instance_id: InstanceId) {
        self.master_instance_id
            .store(master_instance_id, Ordering::Relaxed);
    }

    pub fn version(&self) -> Version {
        self.state.lock().unwrap().version
    }

    /// Newest version known locally: the back of the queue, or the applied version.
    pub fn head_version(&self) -> Version {
        let state = self.state.lock().unwrap();
        state
            .queue
            .back()
            .map(|s| s.version())
            .unwrap_or(state.version)
    }

    /// Accepts one inbound command fragment.
    ///
    /// A slave that has not applied any version yet and has nothing queued only accepts
    /// commands addressed to it directly: a broadcast arriving in that window stems from a
    /// commit that happened before this slave attached and is dropped.
    pub fn handle_command(&self, command: ObjectDataCommand) {
        if command.instance_id != self.instance_id && command.instance_id != INSTANCE_ALL {
            return; // addressed to another slave of this object
        }

        let mut state = self.state.lock().unwrap();

        if state.version == Version::NONE
            && state.queue.is_empty()
            && state.current.is_none()
            && command.instance_id != self.instance_id
        {
            trace!(
                "ignoring v{} broadcast from before this slave attached",
                command.version
            );
            return;
        }

        let ready = if let Some(current) = state.current.as_mut() {
            current.add_command(command)
        } else {
            let stream = VersionInStream::new(command);
            let ready = stream.is_ready();
            state.current = Some(stream);
            ready
        };

        if ready {
            let stream = state.current.take().unwrap();
            trace!(
                "v{} of {} ready ({} bytes)",
                stream.version(),
                self.object_id,
                stream.data_size()
            );
            state.queue.push_back(stream);
            self.ready_cv.notify_all();
        }
    }

    /// Parks the map reply for the mapping thread.
    pub fn note_map_reply(&self, reply: MapReply) {
        self.state.lock().unwrap().map_reply = Some(reply);
        self.ready_cv.notify_all();
    }

    pub fn wait_map_reply(&self, timeout: Option<Duration>) -> ObjectResult<MapReply> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(reply) = state.map_reply.take() {
                return Ok(reply);
            }
            state = self.wait(state, deadline, Version::NONE)?;
        }
    }

    fn wait<'a>(
        &self,
        state: MutexGuard<'a, SlaveState>,
        deadline: Option<Instant>,
        waiting_for: Version,
    ) -> ObjectResult<MutexGuard<'a, SlaveState>> {
        match deadline {
            None => Ok(self.ready_cv.wait(state).unwrap()),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ObjectError::SyncTimeout {
                        waiting_for: waiting_for.0,
                    });
                }
                let (state, _) = self
                    .ready_cv
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                Ok(state)
            }
        }
    }

    /// Advances the object to `target`: `HEAD` drains everything that is ready, `NEXT`
    /// applies exactly one version, a concrete version applies queued streams until it is
    /// reached.
    pub fn sync<T: Distributed>(
        &self,
        object: &mut T,
        target: Version,
    ) -> ObjectResult<Version> {
        let deadline = self.config.default_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();

        if state.version == target {
            return Ok(state.version);
        }

        if target == Version::HEAD {
            while let Some(stream) = state.queue.pop_front() {
                self.apply_one(&mut state, object, stream)?;
            }
            return Ok(state.version);
        }

        let target = if target == Version::NEXT {
            state.version.next()
        } else {
            target
        };
        debug_assert!(target.is_concrete(), "cannot sync to {}", target);
        if state.version > target {
            return Err(ObjectError::VersionMismatch {
                current: state.version.0,
                got: target.0,
            });
        }

        while state.version < target {
            let stream = loop {
                if let Some(stream) = state.queue.pop_front() {
                    break stream;
                }
                state = self.wait(state, deadline, target)?;
            };
            self.apply_one(&mut state, object, stream)?;
        }
        Ok(state.version)
    }

    fn apply_one<T: Distributed>(
        &self,
        state: &mut SlaveState,
        object: &mut T,
        stream: VersionInStream,
    ) -> ObjectResult<()> {
        let version = stream.version();
        if state.version != Version::NONE && version != state.version.next() {
            return Err(ObjectError::VersionMismatch {
                current: state.version.0,
                got: version.0,
            });
        }

        let instance = stream.has_instance_data();
        let mut is = stream.into_istream();
        if instance {
            object.apply_instance_data(&mut is)?;
        } else {
            object.unpack(&mut is)?;
        }
        is.assert_consumed()?;

        state.version = version;
        trace!("applied v{} of {}", version, self.object_id);
        self.send_max_version_ack(version);
        Ok(())
    }

    /// Tells the master how far ahead it may commit, once this slave applied a version.
    fn send_max_version_ack(&self, version: Version) {
        let Some(max_version) = version.low().checked_add(self.max_versions) else {
            return; // unbounded: commits never block on this slave
        };
        self.master.send(NodeCommand::MaxVersion {
            object_id: self.object_id,
            max_version,
        });
    }

    /// Applies the initial instance data of the map handshake: pops streams until the map
    /// version is found, dropping any commit stream that raced ahead of the map data.
    pub fn apply_map_data<T: Distributed>(
        &self,
        object: &mut T,
        version: Version,
    ) -> ObjectResult<()> {
        let deadline = self.config.default_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();

        loop {
            let stream = loop {
                if let Some(stream) = state.queue.pop_front() {
                    break stream;
                }
                state = self.wait(state, deadline, version)?;
            };

            if stream.version() != version {
                // a commit was dispatched to the freshly attached instance before the map
                // data arrived; the map data covers it
                debug!(
                    "dropping v{} received ahead of map data v{}",
                    stream.version(),
                    version
                );
                continue;
            }

            if !stream.has_instance_data() {
                return Err(ObjectError::NotInstanceData);
            }
            if stream.data_size() > 0 {
                let mut is = stream.into_istream();
                object.apply_instance_data(&mut is)?;
                is.assert_consumed()?;
            }
            state.version = version;
            self.send_max_version_ack(version);
            return Ok(());
        }
    }

    /// Merges prefetched instance streams from the peer-local cache into the queue.
    pub fn add_instance_datas(&self, cache: &[VersionInStream], start_version: Version) {
        let mut state = self.state.lock().unwrap();

        let oldest = state.queue.front().map(|s| s.version());
        let newest = state.queue.back().map(|s| s.version());

        let mut head: Vec<VersionInStream> = Vec::new();
        let mut tail: Vec<VersionInStream> = Vec::new();
        for stream in cache {
            let version = stream.version();
            if version < start_version {
                continue;
            }
            debug_assert!(stream.is_ready());
            debug_assert!(stream.has_instance_data());

            match (oldest, newest) {
                (None, None) => tail.push(stream.clone()),
                (Some(oldest), _) if version < oldest => head.push(stream.clone()),
                (_, Some(newest)) if version > newest => tail.push(stream.clone()),
                _ => {} // already queued
            }
        }

        for stream in head.into_iter().rev() {
            if let Some(front) = state.queue.front() {
                debug_assert_eq!(front.version(), stream.version().next());
            }
            state.queue.push_front(stream);
        }
        for stream in tail {
            if let Some(back) = state.queue.back() {
                debug_assert_eq!(back.version().next(), stream.version());
            }
            state.queue.push_back(stream);
        }

        if !state.queue.is_empty() {
            self.ready_cv.notify_all();
        }
    }

    /// Commits a slave-side change: the delta is serialized and handed to the master,
    /// which applies it on its next commit and reports the resulting version.
    /// [`Version::NONE`] is returned if the master is unreachable.
    pub fn commit<T: Distributed>(&self, object: &T, _incarnation: u64) -> Version {
        if !object.is_dirty() {
            return Version::NONE;
        }

        let mut os = DataOStream::enable(
            &self.config,
            CommandKind::Delta,
            self.object_id,
            self.instance_id,
            Version::NONE,
            Vec::new(),
        )
        .target_instance(self.master_instance_id())
        .enable_save();
        object.pack(&mut os);
        os.disable();
        if !os.has_sent_data() {
            return Version::NONE;
        }

        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        let delivered = self.master.send(NodeCommand::SlaveCommit(SlaveCommit {
            object_id: self.object_id,
            commands: os.take_saved(),
            reply: reply_tx,
        }));
        if !delivered {
            return Version::NONE;
        }

        match reply_rx.recv_timeout(self.config.keepalive) {
            Ok(version) => version,
            Err(_) => {
                warn!("slave commit of {} got no reply from the master", self.object_id);
                Version::NONE
            }
        }
    }
}
