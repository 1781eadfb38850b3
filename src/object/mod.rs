//! Versioned object replication: master/slave change managers, version stream framing, and
//! the per-peer object store.

pub mod command;
pub mod istream;
pub mod master;
pub mod object;
pub mod registry;
pub mod slave;
pub mod stream;
pub mod version;

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::error::ObjectResult;
    use crate::object::object::{ChangeKind, Distributed};
    use crate::object::stream::{DataIStream, DataOStream};

    /// A distributable text document. The full state is the text; the delta is the suffix
    /// appended since the last commit, which the application clears after committing.
    pub(crate) struct Doc {
        pub kind: ChangeKind,
        pub text: String,
        pub delta: String,
        pub dirty: bool,
        pub max_versions: u64,
    }

    impl Doc {
        pub fn master(kind: ChangeKind, text: &str) -> Doc {
            Doc {
                kind,
                text: text.to_string(),
                delta: String::new(),
                dirty: false,
                max_versions: u64::MAX,
            }
        }

        pub fn slave() -> Doc {
            Doc {
                kind: ChangeKind::Full,
                text: String::new(),
                delta: String::new(),
                dirty: false,
                max_versions: u64::MAX,
            }
        }

        pub fn append(&mut self, suffix: &str) {
            self.text.push_str(suffix);
            self.delta.push_str(suffix);
            self.dirty = true;
        }

        pub fn committed(&mut self) {
            self.delta.clear();
            self.dirty = false;
        }
    }

    impl Distributed for Doc {
        fn change_kind(&self) -> ChangeKind {
            self.kind
        }

        fn get_instance_data(&self, os: &mut DataOStream) {
            os.write_string(&self.text);
        }

        fn apply_instance_data(&mut self, is: &mut DataIStream) -> ObjectResult<()> {
            self.text = is.read_string()?;
            Ok(())
        }

        fn pack(&self, os: &mut DataOStream) {
            if !self.delta.is_empty() {
                os.write_string(&self.delta);
            }
        }

        fn unpack(&mut self, is: &mut DataIStream) -> ObjectResult<()> {
            let suffix = is.read_string()?;
            self.text.push_str(&suffix);
            self.delta.push_str(&suffix);
            self.dirty = true;
            Ok(())
        }

        fn is_dirty(&self) -> bool {
            self.dirty
        }

        fn max_versions(&self) -> u64 {
            self.max_versions
        }
    }
}
