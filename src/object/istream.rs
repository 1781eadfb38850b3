//! Reassembly of inbound command fragments into complete version streams.

use std::collections::VecDeque;

use tracing::warn;

use crate::object::stream::{CommandKind, DataIStream, ObjectDataCommand};
use crate::object::version::Version;

/// The command fragments of one version of one object, accumulating until the stream is
/// *ready*: the `last` fragment has arrived and the sequence numbers are contiguous from 0.
#[derive(Debug, Clone)]
pub struct VersionInStream {
    version: Version,
    kind: CommandKind,
    commands: VecDeque<ObjectDataCommand>,
    ready: bool,
}

impl VersionInStream {
    pub fn new(first: ObjectDataCommand) -> VersionInStream {
        let ready = first.last && first.sequence == 0;
        VersionInStream {
            version: first.version,
            kind: first.kind,
            commands: if first.sequence == 0 {
                VecDeque::from([first])
            } else {
                // a stream starting mid-version can never become ready; it is created
                // empty and the fragment is dropped
                warn!(
                    "version stream for v{} starts at sequence {} - dropping fragment",
                    first.version, first.sequence
                );
                VecDeque::new()
            },
            ready,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn has_instance_data(&self) -> bool {
        matches!(self.kind, CommandKind::Instance | CommandKind::InstanceMap)
    }

    /// Total payload bytes accumulated so far.
    pub fn data_size(&self) -> usize {
        self.commands.iter().map(|c| c.payload.len()).sum()
    }

    /// Adds the next fragment. Fragments out of sequence or for a different version are a
    /// sender-side bug; they are logged and dropped. Returns whether the stream is ready.
    pub fn add_command(&mut self, command: ObjectDataCommand) -> bool {
        debug_assert!(!self.ready, "adding to a ready stream");

        if command.version != self.version {
            warn!(
                "fragment for v{} in stream of v{} - dropping",
                command.version, self.version
            );
            return self.ready;
        }
        let expected = self.commands.len() as u32;
        if command.sequence != expected {
            warn!(
                "fragment #{} for v{} where #{} was expected - dropping",
                command.sequence, self.version, expected
            );
            return self.ready;
        }

        let last = command.last;
        self.commands.push_back(command);
        if last {
            self.ready = true;
        }
        self.ready
    }

    /// Turns the ready stream into its consuming side.
    pub fn into_istream(self) -> DataIStream {
        debug_assert!(self.ready, "consuming a stream that is not ready");
        DataIStream::new(self.version, self.kind, self.commands)
    }
}
