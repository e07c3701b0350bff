//! Decoder for the common command set (tokens and buckets).
//!
//! Extension decoders wrap a [`CommonDecoder`] and forward ids below
//! [`FIRST_EXTENSION_COMMAND_ID`](aero_cmdbuf_protocol::FIRST_EXTENSION_COMMAND_ID) to it.

use std::collections::HashMap;
use std::sync::Arc;

use aero_cmdbuf_protocol::{
    common_command_info, common_command_name, Buffer, CommandBufferEntry, CommandError,
    CommandId, ContextLostReason, ErrorCode, FixedCommand, GetBucketData, GetBucketStart,
    SetBucketData, SetBucketDataImmediate, SetBucketSize, SetToken,
};

use crate::config::DecoderConfig;
use crate::parser::{AsyncApiHandler, CommandStatus, HandlerResult};

/// What a decoder needs from the service that owns the channel.
pub trait CommandBufferEngine {
    fn get_transfer_buffer(&self, id: i32) -> Option<Buffer>;
    fn set_token(&self, token: i32);
    fn set_get_offset(&self, offset: i32);
    fn set_parse_error(&self, error: ErrorCode);
    fn set_context_lost_reason(&self, reason: ContextLostReason);
}

impl<E: CommandBufferEngine + ?Sized> CommandBufferEngine for Arc<E> {
    fn get_transfer_buffer(&self, id: i32) -> Option<Buffer> {
        (**self).get_transfer_buffer(id)
    }

    fn set_token(&self, token: i32) {
        (**self).set_token(token)
    }

    fn set_get_offset(&self, offset: i32) {
        (**self).set_get_offset(offset)
    }

    fn set_parse_error(&self, error: ErrorCode) {
        (**self).set_parse_error(error)
    }

    fn set_context_lost_reason(&self, reason: ContextLostReason) {
        (**self).set_context_lost_reason(reason)
    }
}

/// Service-side byte buffer that commands fill and drain piecewise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bucket {
    data: Vec<u8>,
}

impl Bucket {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Resize the bucket. Any change of size discards the contents and zero-fills.
    pub fn set_size(&mut self, size: usize) {
        if size != self.data.len() {
            self.data = vec![0; size];
        }
    }

    pub fn data(&self, offset: usize, size: usize) -> Option<&[u8]> {
        let end = offset.checked_add(size)?;
        self.data.get(offset..end)
    }

    /// Copy `src` into the bucket at `offset`. Fails if it does not fit.
    pub fn set_data(&mut self, src: &[u8], offset: usize) -> bool {
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        match self.data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Store `s` followed by a NUL terminator, or empty the bucket for `None`.
    pub fn set_from_string(&mut self, s: Option<&str>) {
        match s {
            None => self.set_size(0),
            Some(s) => {
                self.set_size(s.len() + 1);
                self.data[..s.len()].copy_from_slice(s.as_bytes());
                self.data[s.len()] = 0;
            }
        }
    }

    /// The contents minus the trailing terminator. `None` for an empty bucket or
    /// non-UTF-8 contents.
    pub fn get_as_string(&self) -> Option<String> {
        let (_, body) = self.data.split_last()?;
        String::from_utf8(body.to_vec()).ok()
    }
}

pub struct CommonDecoder<E> {
    engine: E,
    config: DecoderConfig,
    buckets: HashMap<u32, Bucket>,
}

impl<E: CommandBufferEngine> CommonDecoder<E> {
    pub fn new(engine: E, config: DecoderConfig) -> Self {
        Self {
            engine,
            config,
            buckets: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn bucket(&self, id: u32) -> Option<&Bucket> {
        self.buckets.get(&id)
    }

    pub fn bucket_mut(&mut self, id: u32) -> Option<&mut Bucket> {
        self.buckets.get_mut(&id)
    }

    /// The bucket named `id`, created empty if it does not exist yet.
    pub fn create_bucket(&mut self, id: u32) -> &mut Bucket {
        self.buckets.entry(id).or_default()
    }

    /// `size` bytes of transfer buffer `id` starting at `offset`.
    fn shared_memory(&self, id: i32, offset: u32, size: u32) -> Option<Buffer> {
        self.engine
            .get_transfer_buffer(id)?
            .sub_buffer(offset as usize, size as usize)
            .ok()
    }

    /// Execute a command from the common table.
    pub fn do_common_command(
        &mut self,
        command: u32,
        arg_count: u32,
        entries: &[CommandBufferEntry],
    ) -> HandlerResult {
        let info = common_command_info(command).ok_or(CommandError::UnknownCommand(command))?;
        if !info.accepts_arg_count(arg_count) {
            return Err(CommandError::InvalidArguments("wrong argument count"));
        }

        match info.id {
            CommandId::Noop => {}
            CommandId::SetToken => {
                let cmd = SetToken::decode(entries)?;
                self.engine.set_token(cmd.token);
            }
            CommandId::SetBucketSize => self.handle_set_bucket_size(entries)?,
            CommandId::SetBucketData => self.handle_set_bucket_data(entries)?,
            CommandId::SetBucketDataImmediate => self.handle_set_bucket_data_immediate(entries)?,
            CommandId::GetBucketStart => self.handle_get_bucket_start(entries)?,
            CommandId::GetBucketData => self.handle_get_bucket_data(entries)?,
        }
        Ok(CommandStatus::Done)
    }

    fn handle_set_bucket_size(&mut self, entries: &[CommandBufferEntry]) -> Result<(), CommandError> {
        let cmd = SetBucketSize::decode(entries)?;
        let size = cmd.size as usize;
        if size > self.config.max_bucket_size {
            tracing::warn!(
                bucket = cmd.bucket_id,
                size,
                max = self.config.max_bucket_size,
                "bucket size over limit"
            );
            return Err(CommandError::InvalidArguments("bucket size over limit"));
        }
        self.create_bucket(cmd.bucket_id).set_size(size);
        Ok(())
    }

    fn handle_set_bucket_data(&mut self, entries: &[CommandBufferEntry]) -> Result<(), CommandError> {
        let cmd = SetBucketData::decode(entries)?;
        let src = self
            .shared_memory(cmd.shared_memory_id, cmd.shared_memory_offset, cmd.size)
            .ok_or(CommandError::InvalidArguments("source memory out of range"))?;
        let data = src
            .read_vec(0, cmd.size as usize)
            .map_err(|_| CommandError::InvalidArguments("source memory out of range"))?;

        let bucket = self
            .bucket_mut(cmd.bucket_id)
            .ok_or(CommandError::InvalidArguments("unknown bucket"))?;
        if !bucket.set_data(&data, cmd.offset as usize) {
            return Err(CommandError::InvalidArguments("write past the end of the bucket"));
        }
        Ok(())
    }

    fn handle_set_bucket_data_immediate(
        &mut self,
        entries: &[CommandBufferEntry],
    ) -> Result<(), CommandError> {
        let (cmd, data) = SetBucketDataImmediate::decode_with_data(entries)?;
        let bucket = self
            .buckets
            .get_mut(&cmd.bucket_id)
            .ok_or(CommandError::InvalidArguments("unknown bucket"))?;
        if !bucket.set_data(data, cmd.offset as usize) {
            return Err(CommandError::InvalidArguments("write past the end of the bucket"));
        }
        Ok(())
    }

    fn handle_get_bucket_start(&mut self, entries: &[CommandBufferEntry]) -> Result<(), CommandError> {
        let cmd = GetBucketStart::decode(entries)?;
        let result = self.shared_memory(cmd.result_memory_id, cmd.result_memory_offset, 4);

        let data_memory = if cmd.data_memory_size != 0 {
            let memory = self
                .shared_memory(cmd.data_memory_id, cmd.data_memory_offset, cmd.data_memory_size)
                .ok_or(CommandError::InvalidArguments("data memory out of range"))?;
            Some(memory)
        } else {
            None
        };

        let result = result.ok_or(CommandError::InvalidArguments("result memory out of range"))?;
        let current = result
            .read_u32(0)
            .map_err(|_| CommandError::InvalidArguments("result memory out of range"))?;
        // The client must clear the result word before issuing the command.
        if current != 0 {
            return Err(CommandError::InvalidArguments("result word not initialized to 0"));
        }

        let bucket = self
            .bucket(cmd.bucket_id)
            .ok_or(CommandError::InvalidArguments("unknown bucket"))?;
        let bucket_size = u32::try_from(bucket.size())
            .map_err(|_| CommandError::InvalidArguments("bucket too large"))?;
        result
            .write_u32(0, bucket_size)
            .map_err(|_| CommandError::InvalidArguments("result memory out of range"))?;

        if let Some(memory) = data_memory {
            let size = cmd.data_memory_size.min(bucket_size) as usize;
            let src = bucket
                .data(0, size)
                .ok_or(CommandError::InvalidArguments("read past the end of the bucket"))?;
            memory
                .write(0, src)
                .map_err(|_| CommandError::InvalidArguments("data memory out of range"))?;
        }
        Ok(())
    }

    fn handle_get_bucket_data(&mut self, entries: &[CommandBufferEntry]) -> Result<(), CommandError> {
        let cmd = GetBucketData::decode(entries)?;
        let dst = self
            .shared_memory(cmd.shared_memory_id, cmd.shared_memory_offset, cmd.size)
            .ok_or(CommandError::InvalidArguments("destination memory out of range"))?;
        let bucket = self
            .bucket(cmd.bucket_id)
            .ok_or(CommandError::InvalidArguments("unknown bucket"))?;
        let src = bucket
            .data(cmd.offset as usize, cmd.size as usize)
            .ok_or(CommandError::InvalidArguments("read past the end of the bucket"))?;
        dst.write(0, src)
            .map_err(|_| CommandError::InvalidArguments("destination memory out of range"))?;
        Ok(())
    }
}

impl<E: CommandBufferEngine> AsyncApiHandler for CommonDecoder<E> {
    fn do_command(
        &mut self,
        command: u32,
        arg_count: u32,
        entries: &[CommandBufferEntry],
    ) -> HandlerResult {
        self.do_common_command(command, arg_count, entries)
    }

    fn command_name(&self, command: u32) -> &'static str {
        common_command_name(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use aero_cmdbuf_protocol::{CommandHeader, Noop, FIRST_EXTENSION_COMMAND_ID};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeEngine {
        buffers: HashMap<i32, Buffer>,
        token: Mutex<Option<i32>>,
    }

    impl CommandBufferEngine for FakeEngine {
        fn get_transfer_buffer(&self, id: i32) -> Option<Buffer> {
            self.buffers.get(&id).cloned()
        }

        fn set_token(&self, token: i32) {
            *self.token.lock().unwrap() = Some(token);
        }

        fn set_get_offset(&self, _offset: i32) {}

        fn set_parse_error(&self, _error: ErrorCode) {}

        fn set_context_lost_reason(&self, _reason: ContextLostReason) {}
    }

    fn decoder_with_shm(size: usize) -> (CommonDecoder<FakeEngine>, Buffer) {
        let shm = Buffer::new(size);
        let mut engine = FakeEngine::default();
        engine.buffers.insert(7, shm.clone());
        (CommonDecoder::new(engine, DecoderConfig::default()), shm)
    }

    fn run<C: FixedCommand>(decoder: &mut CommonDecoder<FakeEngine>, cmd: &C) -> HandlerResult {
        let entries = cmd.as_entries();
        decoder.do_command(C::COMMAND_ID, entries.len() as u32 - 1, entries)
    }

    fn immediate(bucket_id: u32, offset: u32, data: &[u8]) -> Vec<CommandBufferEntry> {
        let prefix = SetBucketDataImmediate::new(bucket_id, offset, data.len() as u32).unwrap();
        let mut entries = prefix.as_entries().to_vec();
        let mut padded = data.to_vec();
        padded.resize(data.len().div_ceil(4) * 4, 0);
        entries.extend(le_words(&padded));
        entries
    }

    fn le_words(bytes: &[u8]) -> impl Iterator<Item = CommandBufferEntry> + '_ {
        bytes
            .chunks_exact(4)
            .map(|c| CommandBufferEntry::from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
    }

    #[test]
    fn bucket_helpers() {
        let mut bucket = Bucket::default();
        assert_eq!(bucket.get_as_string(), None);

        bucket.set_from_string(Some("hello"));
        assert_eq!(bucket.size(), 6);
        assert_eq!(bucket.data(0, 6), Some(&b"hello\0"[..]));
        assert_eq!(bucket.get_as_string().as_deref(), Some("hello"));

        assert!(bucket.set_data(b"J", 0));
        assert_eq!(bucket.get_as_string().as_deref(), Some("Jello"));
        assert!(!bucket.set_data(b"xyz", 4));
        assert_eq!(bucket.data(5, 2), None);
        assert_eq!(bucket.data(usize::MAX, 2), None);

        // Resizing discards the old contents.
        bucket.set_size(3);
        assert_eq!(bucket.data(0, 3), Some(&[0u8, 0, 0][..]));

        bucket.set_from_string(None);
        assert_eq!(bucket.size(), 0);
    }

    #[test]
    fn set_token_reaches_the_engine() {
        let (mut decoder, _) = decoder_with_shm(16);
        assert_eq!(run(&mut decoder, &SetToken::new(42)), Ok(CommandStatus::Done));
        assert_eq!(*decoder.engine().token.lock().unwrap(), Some(42));
    }

    #[test]
    fn noop_accepts_skipped_entries() {
        let (mut decoder, _) = decoder_with_shm(16);
        let header = Noop::header_for_skip(3).unwrap();
        let entries = [
            CommandBufferEntry::from_header(header),
            CommandBufferEntry::ZERO,
            CommandBufferEntry::ZERO,
            CommandBufferEntry::ZERO,
        ];
        assert_eq!(decoder.do_command(0, 3, &entries), Ok(CommandStatus::Done));
    }

    #[test]
    fn argument_counts_are_validated() {
        let (mut decoder, _) = decoder_with_shm(16);
        let cmd = SetToken::new(1);
        let entries = cmd.as_entries();
        assert_eq!(
            decoder.do_command(SetToken::COMMAND_ID, 2, entries),
            Err(CommandError::InvalidArguments("wrong argument count"))
        );

        let prefix = SetBucketDataImmediate::new(1, 0, 0).unwrap();
        assert_eq!(
            decoder
                .do_command(SetBucketDataImmediate::COMMAND_ID, 2, &prefix.as_entries()[..3])
                .map_err(|e| e.code()),
            Err(ErrorCode::InvalidArguments)
        );
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let (mut decoder, _) = decoder_with_shm(16);
        let header = CommandHeader::new(FIRST_EXTENSION_COMMAND_ID, 1).unwrap();
        let entries = [CommandBufferEntry::from_header(header)];
        assert_eq!(
            decoder.do_command(FIRST_EXTENSION_COMMAND_ID, 0, &entries),
            Err(CommandError::UnknownCommand(FIRST_EXTENSION_COMMAND_ID))
        );
        assert_eq!(decoder.command_name(7), "unknown");
        assert_eq!(decoder.command_name(1), "SetToken");
    }

    #[test]
    fn set_bucket_size_is_bounded() {
        let (mut decoder, _) = decoder_with_shm(16);
        decoder.config.max_bucket_size = 64;
        assert_eq!(run(&mut decoder, &SetBucketSize::new(3, 64)), Ok(CommandStatus::Done));
        assert_eq!(decoder.bucket(3).map(Bucket::size), Some(64));
        assert!(run(&mut decoder, &SetBucketSize::new(3, 65)).is_err());
        assert_eq!(decoder.bucket(3).map(Bucket::size), Some(64));
    }

    #[test]
    fn set_bucket_data_copies_from_shared_memory() {
        let (mut decoder, shm) = decoder_with_shm(64);
        shm.write(8, b"abcdef").unwrap();

        // No bucket yet.
        assert!(run(&mut decoder, &SetBucketData::new(1, 0, 6, 7, 8)).is_err());

        run(&mut decoder, &SetBucketSize::new(1, 10)).unwrap();
        assert_eq!(run(&mut decoder, &SetBucketData::new(1, 2, 6, 7, 8)), Ok(CommandStatus::Done));
        assert_eq!(decoder.bucket(1).unwrap().data(0, 10), Some(&b"\0\0abcdef\0\0"[..]));

        // Past the end of the bucket, past the end of the memory, unknown memory.
        assert!(run(&mut decoder, &SetBucketData::new(1, 6, 6, 7, 8)).is_err());
        assert!(run(&mut decoder, &SetBucketData::new(1, 0, 6, 7, 60)).is_err());
        assert!(run(&mut decoder, &SetBucketData::new(1, 0, 6, 8, 0)).is_err());
        assert!(run(&mut decoder, &SetBucketData::new(1, 0, 6, 0, 0)).is_err());
    }

    #[test]
    fn set_bucket_data_immediate_copies_inline_data() {
        let (mut decoder, _) = decoder_with_shm(16);
        run(&mut decoder, &SetBucketSize::new(2, 8)).unwrap();

        let entries = immediate(2, 1, b"xyz");
        let arg_count = entries.len() as u32 - 1;
        assert_eq!(
            decoder.do_command(SetBucketDataImmediate::COMMAND_ID, arg_count, &entries),
            Ok(CommandStatus::Done)
        );
        assert_eq!(decoder.bucket(2).unwrap().data(0, 5), Some(&b"\0xyz\0"[..]));

        let entries = immediate(2, 6, b"xyz");
        assert!(decoder
            .do_command(SetBucketDataImmediate::COMMAND_ID, arg_count, &entries)
            .is_err());
    }

    #[test]
    fn get_bucket_start_reports_size_and_copies_prefix() {
        let (mut decoder, shm) = decoder_with_shm(64);
        decoder.create_bucket(4).set_from_string(Some("bucket!"));

        let cmd = GetBucketStart::new(4, 7, 0, 4, 7, 16);
        assert_eq!(run(&mut decoder, &cmd), Ok(CommandStatus::Done));
        assert_eq!(shm.read_u32(0).unwrap(), 8);
        assert_eq!(shm.read_vec(16, 5).unwrap(), b"buck\0".to_vec());

        // The result word is now non-zero.
        assert!(run(&mut decoder, &cmd).is_err());

        shm.write_u32(0, 0).unwrap();
        let size_only = GetBucketStart::new(4, 7, 0, 0, 0, 0);
        assert_eq!(run(&mut decoder, &size_only), Ok(CommandStatus::Done));
        assert_eq!(shm.read_u32(0).unwrap(), 8);

        shm.write_u32(0, 0).unwrap();
        assert!(run(&mut decoder, &GetBucketStart::new(5, 7, 0, 0, 0, 0)).is_err());
        assert!(run(&mut decoder, &GetBucketStart::new(4, 7, 62, 0, 0, 0)).is_err());
        assert!(run(&mut decoder, &GetBucketStart::new(4, 7, 0, 64, 7, 16)).is_err());
    }

    #[test]
    fn get_bucket_start_ignores_data_location_without_a_size() {
        let (mut decoder, shm) = decoder_with_shm(64);
        decoder.create_bucket(4).set_from_string(Some("abc"));
        shm.write(16, b"keep").unwrap();

        // Id 99 is not a transfer buffer, but no data was requested.
        let cmd = GetBucketStart::new(4, 7, 0, 0, 99, 16);
        assert_eq!(run(&mut decoder, &cmd), Ok(CommandStatus::Done));
        assert_eq!(shm.read_u32(0).unwrap(), 4);
        assert_eq!(shm.read_vec(16, 4).unwrap(), b"keep".to_vec());
    }

    #[test]
    fn get_bucket_data_copies_out() {
        let (mut decoder, shm) = decoder_with_shm(32);
        decoder.create_bucket(9).set_from_string(Some("0123456789"));

        assert_eq!(run(&mut decoder, &GetBucketData::new(9, 3, 4, 7, 8)), Ok(CommandStatus::Done));
        assert_eq!(shm.read_vec(8, 4).unwrap(), b"3456".to_vec());

        assert!(run(&mut decoder, &GetBucketData::new(9, 8, 4, 7, 0)).is_err());
        assert!(run(&mut decoder, &GetBucketData::new(9, 0, 4, 7, 30)).is_err());
        assert!(run(&mut decoder, &GetBucketData::new(1, 0, 4, 7, 0)).is_err());
    }
}
