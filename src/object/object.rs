//! The application-facing object trait.

use crate::error::ObjectResult;
use crate::object::stream::{DataIStream, DataOStream};

/// How an object's changes travel to its slaves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChangeKind {
    /// Every commit sends a full instance snapshot.
    Full,
    /// Commits send deltas; snapshots are retained on the side for late subscribers.
    Delta,
}

/// A distributable object. The master serializes its state through
/// [`get_instance_data`](Distributed::get_instance_data) and
/// [`pack`](Distributed::pack); slaves reconstruct it through the matching apply methods.
///
/// The change manager owns no reference to the object - it borrows it for the duration of
/// each operation, which keeps the object/manager lifetime cycle out of the type system.
pub trait Distributed: Send + 'static {
    fn change_kind(&self) -> ChangeKind {
        ChangeKind::Full
    }

    /// Serializes the full state, sufficient to construct a slave from scratch.
    fn get_instance_data(&self, os: &mut DataOStream);

    /// Reconstructs the state from a full snapshot. The stream must be consumed completely.
    fn apply_instance_data(&mut self, is: &mut DataIStream) -> ObjectResult<()>;

    /// Serializes the change since the last commit. Defaults to the full snapshot.
    fn pack(&self, os: &mut DataOStream) {
        self.get_instance_data(os);
    }

    /// Applies an incremental change. Defaults to applying a full snapshot.
    fn unpack(&mut self, is: &mut DataIStream) -> ObjectResult<()> {
        self.apply_instance_data(is)
    }

    /// Whether there is anything to commit. A clean object's commit only advances the
    /// incarnation bookkeeping.
    fn is_dirty(&self) -> bool {
        true
    }

    /// Upper bound on versions a slave buffers before the master's commits block. The
    /// default never blocks.
    fn max_versions(&self) -> u64 {
        u64::MAX
    }
}
