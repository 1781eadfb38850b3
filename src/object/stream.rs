//! Framed command streams carrying one version of one object.
//!
//! A version's payload travels as a sequence of [`ObjectDataCommand`] records: each carries
//! the object and target instance, the version, a within-version sequence number and a
//! *last* flag. [`DataOStream`] produces such a stream from an object's serialization
//! callbacks, cutting the payload at the configured flush threshold and optionally running
//! each cut through a compressor. [`DataIStream`] is the consuming side.
//!
//! All encodings are little-endian and length-prefixed.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use tracing::trace;

use crate::config::Config;
use crate::error::{ObjectError, ObjectResult};
use crate::object::version::{InstanceId, ObjectId, Version, INSTANCE_ALL};
use crate::util::safe_converter::PrecheckedCast;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandKind {
    /// A full instance snapshot.
    Instance = 0,
    /// An incremental change relative to the previous version.
    Delta = 1,
    /// An instance snapshot sent as part of a map reply.
    InstanceMap = 2,
}

/// One fragment of a version stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDataCommand {
    pub kind: CommandKind,
    pub object_id: ObjectId,
    /// Target instance, or [`INSTANCE_ALL`] for a broadcast.
    pub instance_id: InstanceId,
    /// Instance id of the sending master.
    pub master_instance_id: InstanceId,
    pub version: Version,
    /// Position of this fragment within its version, starting at 0.
    pub sequence: u32,
    pub last: bool,
    /// 0 means uncompressed.
    pub compressor_id: u32,
    pub uncompressed_size: u64,
    /// Compressed chunk sizes; the payload is the chunk concatenation.
    pub chunk_sizes: Vec<u64>,
    pub payload: Bytes,
}

impl ObjectDataCommand {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u128_le(self.object_id.as_u128());
        buf.put_u32_le(self.instance_id);
        buf.put_u32_le(self.master_instance_id);
        self.version.ser(buf);
        buf.put_u32_le(self.sequence);
        buf.put_u8(self.last as u8);
        buf.put_u32_le(self.compressor_id);
        buf.put_u64_le(self.uncompressed_size);
        buf.put_u32_le(self.chunk_sizes.len() as u32);
        for &size in &self.chunk_sizes {
            buf.put_u64_le(size);
        }
        buf.put_u64_le(self.payload.len() as u64);
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ObjectDataCommand> {
        if buf.remaining() < 1 + 16 + 4 + 4 + 16 + 4 + 1 + 4 + 8 + 4 {
            bail!("truncated object data command");
        }
        let kind = CommandKind::try_from(buf.get_u8())?;
        let object_id = ObjectId::from_u128(buf.get_u128_le());
        let instance_id = buf.get_u32_le();
        let master_instance_id = buf.get_u32_le();
        let version = Version::deser(buf);
        let sequence = buf.get_u32_le();
        let last = buf.get_u8() != 0;
        let compressor_id = buf.get_u32_le();
        let uncompressed_size = buf.get_u64_le();

        let chunk_count = buf.get_u32_le() as usize;
        if buf.remaining() < chunk_count * 8 {
            bail!("object data command truncated in chunk table");
        }
        let mut chunk_sizes = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            chunk_sizes.push(buf.get_u64_le());
        }

        if buf.remaining() < 8 {
            bail!("object data command truncated before payload");
        }
        let payload_len = buf.get_u64_le() as usize;
        if buf.remaining() < payload_len {
            bail!("object data command truncated in payload");
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(ObjectDataCommand {
            kind,
            object_id,
            instance_id,
            master_instance_id,
            version,
            sequence,
            last,
            compressor_id,
            uncompressed_size,
            chunk_sizes,
            payload,
        })
    }

    /// A copy of this command readdressed to one specific instance, used when replaying a
    /// retained snapshot to a late subscriber.
    pub fn retargeted(&self, kind: CommandKind, instance_id: InstanceId) -> ObjectDataCommand {
        let mut command = self.clone();
        command.kind = kind;
        command.instance_id = instance_id;
        command
    }
}

/// Receives the framed commands of a stream; implemented by node links and test doubles.
#[cfg_attr(test, mockall::automock)]
pub trait CommandSink: Send + Sync {
    fn send_command(&self, command: ObjectDataCommand);
}

/// Per-stream payload compression. Id 0 is the identity transform.
pub trait Compressor: Send + Sync {
    fn id(&self) -> u32;
    fn compress(&self, data: &[u8]) -> Vec<Vec<u8>>;
    fn decompress(&self, chunks: &[&[u8]], uncompressed_size: usize) -> ObjectResult<Vec<u8>>;
}

pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn id(&self) -> u32 {
        0
    }

    fn compress(&self, data: &[u8]) -> Vec<Vec<u8>> {
        vec![data.to_vec()]
    }

    fn decompress(&self, chunks: &[&[u8]], _uncompressed_size: usize) -> ObjectResult<Vec<u8>> {
        let mut result = Vec::new();
        for chunk in chunks {
            result.extend_from_slice(chunk);
        }
        Ok(result)
    }
}

/// Looks up the decompressor for a wire compressor id.
pub fn compressor_for(id: u32) -> ObjectResult<Arc<dyn Compressor>> {
    match id {
        0 => Ok(Arc::new(IdentityCompressor)),
        other => Err(ObjectError::UnknownCompressor(other)),
    }
}

/// Buffered producer of one version stream.
///
/// Data written through the `write_*` methods is staged and cut into commands of at most
/// the configured flush threshold; [`disable`](DataOStream::disable) emits the final
/// command carrying the *last* flag. Commands go to the attached sinks and, with
/// [`enable_save`](DataOStream::enable_save), into a retained copy for later replay.
pub struct DataOStream {
    kind: CommandKind,
    object_id: ObjectId,
    instance_id: InstanceId,
    master_instance_id: InstanceId,
    version: Version,
    flush_size: usize,
    compression_threshold: usize,
    compressor: Arc<dyn Compressor>,
    staging: BytesMut,
    sequence: u32,
    has_sent_data: bool,
    enabled: bool,
    sinks: Vec<Arc<dyn CommandSink>>,
    saved: Option<Vec<ObjectDataCommand>>,
}

impl DataOStream {
    pub fn enable(
        config: &Config,
        kind: CommandKind,
        object_id: ObjectId,
        master_instance_id: InstanceId,
        version: Version,
        sinks: Vec<Arc<dyn CommandSink>>,
    ) -> DataOStream {
        DataOStream {
            kind,
            object_id,
            instance_id: INSTANCE_ALL,
            master_instance_id,
            version,
            flush_size: config.object_buffer_size,
            compression_threshold: config.compression_threshold,
            compressor: Arc::new(IdentityCompressor),
            staging: BytesMut::new(),
            sequence: 0,
            has_sent_data: false,
            enabled: true,
            sinks,
            saved: None,
        }
    }

    /// Addresses the stream to one specific instance instead of broadcasting.
    pub fn target_instance(mut self, instance_id: InstanceId) -> DataOStream {
        self.instance_id = instance_id;
        self
    }

    /// Additionally retains every emitted command for later replay.
    pub fn enable_save(self) -> DataOStream {
        self.save_into(Vec::new())
    }

    /// Like [`enable_save`](DataOStream::enable_save), reusing a released command vector.
    pub fn save_into(mut self, mut commands: Vec<ObjectDataCommand>) -> DataOStream {
        commands.clear();
        self.saved = Some(commands);
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn has_sent_data(&self) -> bool {
        self.has_sent_data
    }

    pub fn write_u8(&mut self, value: u8) {
        self.append(&[value]);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.append(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.append(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.append(&value.to_le_bytes());
    }

    pub fn write_u128(&mut self, value: u128) {
        self.append(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.append(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.append(&value.to_le_bytes());
    }

    /// Writes a byte buffer as `{u64 size, bytes}`.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_u64(data.len() as u64);
        self.append(data);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Writes an ordered sequence as `{u64 count, items...}`.
    pub fn write_seq<T>(&mut self, items: &[T], mut write_item: impl FnMut(&mut Self, &T)) {
        self.write_u64(items.len() as u64);
        for item in items {
            write_item(self, item);
        }
    }

    /// Writes a mapping as a length-prefixed pair sequence.
    pub fn write_map<'a, K: 'a, V: 'a>(
        &mut self,
        entries: impl ExactSizeIterator<Item = (&'a K, &'a V)>,
        mut write_entry: impl FnMut(&mut Self, &K, &V),
    ) {
        self.write_u64(entries.len() as u64);
        for (key, value) in entries {
            write_entry(self, key, value);
        }
    }

    fn append(&mut self, data: &[u8]) {
        debug_assert!(self.enabled, "writing to a disabled stream");
        self.staging.put_slice(data);
        while self.staging.len() >= self.flush_size {
            let chunk = self.staging.split_to(self.flush_size);
            self.emit(&chunk, false);
        }
    }

    fn emit(&mut self, payload: &[u8], last: bool) {
        let (compressor_id, chunks) = if payload.len() >= self.compression_threshold {
            (self.compressor.id(), self.compressor.compress(payload))
        } else {
            (0, vec![payload.to_vec()])
        };

        let chunk_sizes: Vec<u64> = chunks.iter().map(|c| c.len().prechecked_cast()).collect();
        let command = ObjectDataCommand {
            kind: self.kind,
            object_id: self.object_id,
            instance_id: self.instance_id,
            master_instance_id: self.master_instance_id,
            version: self.version,
            sequence: self.sequence,
            last,
            compressor_id,
            uncompressed_size: payload.len() as u64,
            chunk_sizes,
            payload: chunks.concat().into(),
        };
        self.sequence += 1;
        self.has_sent_data = true;

        trace!(
            "emitting {:?} command #{} for {} v{} ({} bytes, last {})",
            command.kind,
            command.sequence,
            command.object_id,
            command.version,
            command.payload.len(),
            last
        );
        for sink in &self.sinks {
            sink.send_command(command.clone());
        }
        if let Some(saved) = &mut self.saved {
            saved.push(command);
        }
    }

    /// Ends the stream: flushes the staged remainder as the *last* command. A stream that
    /// never produced any data emits nothing at all.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        if !self.staging.is_empty() || self.has_sent_data {
            let chunk = self.staging.split();
            self.emit(&chunk, true);
        }
    }

    /// The retained commands accumulated under [`enable_save`](DataOStream::enable_save).
    pub fn take_saved(&mut self) -> Vec<ObjectDataCommand> {
        self.saved.take().unwrap_or_default()
    }
}

/// Consuming side of a ready version stream. Reads may span command boundaries; once the
/// object is done, both the position inside the current buffer and the remaining buffer
/// count must be zero.
pub struct DataIStream {
    version: Version,
    kind: CommandKind,
    commands: VecDeque<ObjectDataCommand>,
    current: Vec<u8>,
    position: usize,
}

impl DataIStream {
    pub fn new(
        version: Version,
        kind: CommandKind,
        commands: VecDeque<ObjectDataCommand>,
    ) -> DataIStream {
        DataIStream {
            version,
            kind,
            commands,
            current: Vec::new(),
            position: 0,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn has_instance_data(&self) -> bool {
        matches!(self.kind, CommandKind::Instance | CommandKind::InstanceMap)
    }

    fn next_buffer(&mut self) -> ObjectResult<bool> {
        loop {
            let Some(command) = self.commands.pop_front() else {
                return Ok(false);
            };
            if command.payload.is_empty() {
                continue;
            }

            let compressor = compressor_for(command.compressor_id)?;
            let mut chunks: Vec<&[u8]> = Vec::with_capacity(command.chunk_sizes.len());
            let mut offset = 0usize;
            for &size in &command.chunk_sizes {
                let size = size as usize;
                chunks.push(&command.payload[offset..offset + size]);
                offset += size;
            }
            self.current =
                compressor.decompress(&chunks, command.uncompressed_size as usize)?;
            self.position = 0;
            return Ok(true);
        }
    }

    /// Reads exactly `out.len()` bytes, spanning command boundaries as needed.
    pub fn read_exact(&mut self, out: &mut [u8]) -> ObjectResult<()> {
        let mut done = 0;
        while done < out.len() {
            if self.position >= self.current.len() {
                if !self.next_buffer()? {
                    return Err(ObjectError::StreamExhausted { what: "bytes" });
                }
            }
            let available = self.current.len() - self.position;
            let take = available.min(out.len() - done);
            out[done..done + take]
                .copy_from_slice(&self.current[self.position..self.position + take]);
            self.position += take;
            done += take;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> ObjectResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_bool(&mut self) -> ObjectResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> ObjectResult<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> ObjectResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> ObjectResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u128(&mut self) -> ObjectResult<u128> {
        let mut buf = [0u8; 16];
        self.read_exact(&mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> ObjectResult<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_f64(&mut self) -> ObjectResult<f64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self) -> ObjectResult<Vec<u8>> {
        let len = self.read_u64()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_string(&mut self) -> ObjectResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| ObjectError::StreamExhausted { what: "utf-8" })
    }

    /// Unconsumed bytes of the buffer currently being read.
    pub fn remaining_in_buffer(&self) -> usize {
        self.current.len() - self.position
    }

    /// Buffers not yet started. An empty trailing command only carries the *last* flag and
    /// does not count.
    pub fn remaining_buffers(&self) -> usize {
        self.commands.iter().filter(|c| !c.payload.is_empty()).count()
    }

    /// Verifies that the object consumed the stream completely.
    pub fn assert_consumed(&self) -> ObjectResult<()> {
        if self.remaining_in_buffer() > 0 || self.remaining_buffers() > 0 {
            return Err(ObjectError::IncompleteConsume {
                remaining_bytes: self.remaining_in_buffer(),
                remaining_buffers: self.remaining_buffers(),
            });
        }
        Ok(())
    }
}
