//! Command parser: walks the ring from get towards put and hands each command to an
//! [`AsyncApiHandler`].

use aero_cmdbuf_protocol::{
    Buffer, BufferAccessError, CommandBufferEntry, CommandError, ContextLostReason,
    COMMAND_BUFFER_ENTRY_SIZE,
};

/// Outcome of a successfully handled command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// Consumed; get advances past the command.
    Done,
    /// Not consumed; the same command is retried on the next pass.
    DeferUntilLater,
    /// Consumed; get moves to the given entry index instead of past the command.
    Jump(i32),
}

pub type HandlerResult = Result<CommandStatus, CommandError>;

/// Executes decoded commands.
pub trait AsyncApiHandler {
    /// Run one command. `entries` is the whole command, header included, and
    /// `arg_count` is `entries.len() - 1`.
    fn do_command(
        &mut self,
        command: u32,
        arg_count: u32,
        entries: &[CommandBufferEntry],
    ) -> HandlerResult;

    fn command_name(&self, command: u32) -> &'static str;

    fn was_context_lost(&self) -> bool {
        false
    }

    fn context_lost_reason(&self) -> ContextLostReason {
        ContextLostReason::Unknown
    }
}

impl<H: AsyncApiHandler + ?Sized> AsyncApiHandler for &mut H {
    fn do_command(
        &mut self,
        command: u32,
        arg_count: u32,
        entries: &[CommandBufferEntry],
    ) -> HandlerResult {
        (**self).do_command(command, arg_count, entries)
    }

    fn command_name(&self, command: u32) -> &'static str {
        (**self).command_name(command)
    }

    fn was_context_lost(&self) -> bool {
        (**self).was_context_lost()
    }

    fn context_lost_reason(&self) -> ContextLostReason {
        (**self).context_lost_reason()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParserSetupError {
    #[error("ring buffer view is not 4-byte aligned (offset {offset}, size {size})")]
    Misaligned { offset: usize, size: usize },

    #[error("ring buffer view out of bounds: {0}")]
    OutOfBounds(#[from] BufferAccessError),

    #[error("ring buffer of {size} bytes holds more entries than an i32 offset can address")]
    TooLarge { size: usize },
}

#[derive(Debug, Default)]
pub struct CommandParser {
    buffer: Option<Buffer>,
    entry_count: i32,
    get: i32,
    put: i32,
    scratch: Vec<CommandBufferEntry>,
}

impl CommandParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse commands from `size` bytes of `buffer` starting at `offset`. Resets get and put.
    pub fn set_buffer(
        &mut self,
        buffer: &Buffer,
        offset: usize,
        size: usize,
    ) -> Result<(), ParserSetupError> {
        if !buffer.is_aligned()
            || offset % COMMAND_BUFFER_ENTRY_SIZE != 0
            || size % COMMAND_BUFFER_ENTRY_SIZE != 0
        {
            return Err(ParserSetupError::Misaligned {
                offset: buffer.offset() + offset,
                size,
            });
        }
        let view = buffer.sub_buffer(offset, size)?;
        let entry_count = i32::try_from(view.entry_count())
            .map_err(|_| ParserSetupError::TooLarge { size })?;

        self.buffer = Some(view);
        self.entry_count = entry_count;
        self.get = 0;
        self.put = 0;
        Ok(())
    }

    /// Detach from the ring. The parser is then always empty.
    pub fn clear_buffer(&mut self) {
        self.buffer = None;
        self.entry_count = 0;
        self.get = 0;
        self.put = 0;
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    pub fn get(&self) -> i32 {
        self.get
    }

    pub fn put(&self) -> i32 {
        self.put
    }

    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    /// Accepts `0..=entry_count`; a put equal to the entry count stops parsing at the end
    /// of the ring.
    pub fn set_put(&mut self, put: i32) -> bool {
        if !(0..=self.entry_count).contains(&put) {
            return false;
        }
        self.put = put;
        if self.get == self.entry_count && put != self.entry_count {
            self.get = 0;
        }
        true
    }

    pub fn set_get(&mut self, get: i32) -> bool {
        if get != 0 && !(0..self.entry_count).contains(&get) {
            return false;
        }
        self.get = get;
        true
    }

    /// Entry index following a command of `size` entries at `get`.
    fn next_get(&self, get: i32, size: u32) -> i32 {
        let next = get + size as i32;
        if next == self.entry_count && self.put != self.entry_count {
            0
        } else {
            next
        }
    }

    /// Process the command at get.
    ///
    /// Errors raised before the handler runs (bad size, command past the end of the ring)
    /// leave get untouched. Handler errors consume the failing command.
    pub fn process_command<H: AsyncApiHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> HandlerResult {
        if self.is_empty() {
            return Ok(CommandStatus::Done);
        }
        let Some(buffer) = self.buffer.as_ref() else {
            return Ok(CommandStatus::Done);
        };

        let get = self.get;
        let header = buffer
            .read_u32(get as usize * COMMAND_BUFFER_ENTRY_SIZE)
            .map(|raw| CommandBufferEntry::from_u32(raw).header())
            .map_err(|_| CommandError::OutOfBounds)?;

        let size = header.size();
        if size == 0 {
            tracing::warn!(get, "command header with size 0");
            return Err(CommandError::InvalidSize);
        }
        if i64::from(get) + i64::from(size) > i64::from(self.entry_count) {
            tracing::warn!(
                get,
                size,
                entry_count = self.entry_count,
                "command runs past the end of the ring"
            );
            return Err(CommandError::OutOfBounds);
        }

        // Copy out of shared memory so the producer cannot change the command while the
        // handler reads it.
        self.scratch.clear();
        self.scratch.resize(size as usize, CommandBufferEntry::ZERO);
        buffer
            .read_entries(get as usize, &mut self.scratch)
            .map_err(|_| CommandError::OutOfBounds)?;

        let command = header.command();
        let result = handler.do_command(command, size - 1, &self.scratch);

        match result {
            Ok(CommandStatus::Done) => {
                self.get = self.next_get(get, size);
            }
            Ok(CommandStatus::DeferUntilLater) => {}
            Ok(CommandStatus::Jump(target)) => {
                if !(0..self.entry_count).contains(&target) {
                    tracing::warn!(
                        command = handler.command_name(command),
                        target,
                        "jump target outside the ring"
                    );
                    return Err(CommandError::OutOfBounds);
                }
                self.get = target;
            }
            Err(ref err) => {
                tracing::warn!(
                    command = handler.command_name(command),
                    id = command,
                    error = %err,
                    "command failed"
                );
                self.get = self.next_get(get, size);
            }
        }
        result
    }

    /// Process commands until the ring is empty, a command fails, or one is deferred.
    pub fn process_all_commands<H: AsyncApiHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> HandlerResult {
        while !self.is_empty() {
            match self.process_command(handler)? {
                CommandStatus::DeferUntilLater => return Ok(CommandStatus::DeferUntilLater),
                CommandStatus::Done | CommandStatus::Jump(_) => {}
            }
        }
        Ok(CommandStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aero_cmdbuf_protocol::CommandHeader;
    use pretty_assertions::assert_eq;

    /// Records every command it sees and answers with a scripted status per id.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(u32, u32, Vec<u32>)>,
        defer_id: Option<u32>,
        fail_id: Option<u32>,
        jump: Option<(u32, i32)>,
    }

    impl AsyncApiHandler for Recorder {
        fn do_command(
            &mut self,
            command: u32,
            arg_count: u32,
            entries: &[CommandBufferEntry],
        ) -> HandlerResult {
            self.seen.push((
                command,
                arg_count,
                entries.iter().map(|e| e.value_u32()).collect(),
            ));
            if self.defer_id == Some(command) {
                return Ok(CommandStatus::DeferUntilLater);
            }
            if self.fail_id == Some(command) {
                return Err(CommandError::InvalidArguments("scripted failure"));
            }
            match self.jump {
                Some((id, target)) if id == command => Ok(CommandStatus::Jump(target)),
                _ => Ok(CommandStatus::Done),
            }
        }

        fn command_name(&self, _command: u32) -> &'static str {
            "Recorded"
        }
    }

    fn header(command: u32, size: u32) -> u32 {
        CommandHeader::new(command, size).unwrap().to_u32()
    }

    fn ring(words: &[u32], entries: usize) -> Buffer {
        let buffer = Buffer::new(entries * COMMAND_BUFFER_ENTRY_SIZE);
        for (i, w) in words.iter().enumerate() {
            buffer.write_u32(i * 4, *w).unwrap();
        }
        buffer
    }

    fn parser_for(buffer: &Buffer) -> CommandParser {
        let mut parser = CommandParser::new();
        parser.set_buffer(buffer, 0, buffer.size()).unwrap();
        parser
    }

    #[test]
    fn set_buffer_validates_alignment_and_bounds() {
        let buffer = Buffer::new(64);
        let mut parser = CommandParser::new();

        assert!(matches!(
            parser.set_buffer(&buffer, 2, 16),
            Err(ParserSetupError::Misaligned { .. })
        ));
        assert!(matches!(
            parser.set_buffer(&buffer, 0, 18),
            Err(ParserSetupError::Misaligned { .. })
        ));
        assert!(matches!(
            parser.set_buffer(&buffer, 32, 64),
            Err(ParserSetupError::OutOfBounds(_))
        ));

        parser.set_buffer(&buffer, 16, 32).unwrap();
        assert_eq!(parser.entry_count(), 8);
        assert_eq!((parser.get(), parser.put()), (0, 0));
    }

    #[test]
    fn put_and_get_are_range_checked() {
        let buffer = Buffer::new(32);
        let mut parser = parser_for(&buffer);
        assert!(parser.set_put(7));
        assert!(parser.set_put(8));
        assert!(!parser.set_put(9));
        assert!(!parser.set_put(-1));
        assert!(parser.set_put(7));
        assert!(parser.set_get(3));
        assert!(!parser.set_get(8));
        assert_eq!((parser.get(), parser.put()), (3, 7));
    }

    #[test]
    fn empty_parser_processes_nothing() {
        let mut parser = CommandParser::new();
        let mut handler = Recorder::default();
        assert_eq!(parser.process_command(&mut handler), Ok(CommandStatus::Done));
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn commands_are_dispatched_in_order() {
        let buffer = ring(
            &[header(300, 1), header(301, 3), 0xAA, 0xBB, header(302, 2), 0xCC],
            16,
        );
        let mut parser = parser_for(&buffer);
        let mut handler = Recorder::default();
        assert!(parser.set_put(6));

        assert_eq!(parser.process_all_commands(&mut handler), Ok(CommandStatus::Done));
        assert_eq!(
            handler.seen,
            vec![
                (300, 0, vec![header(300, 1)]),
                (301, 2, vec![header(301, 3), 0xAA, 0xBB]),
                (302, 1, vec![header(302, 2), 0xCC]),
            ]
        );
        assert_eq!(parser.get(), 6);
    }

    #[test]
    fn oversized_command_is_rejected_without_advancing() {
        let buffer = ring(&[header(300, 100)], 8);
        let mut parser = parser_for(&buffer);
        assert!(parser.set_put(8));
        let mut handler = Recorder::default();

        assert_eq!(parser.process_command(&mut handler), Err(CommandError::OutOfBounds));
        assert_eq!(parser.get(), 0);
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn zero_size_header_is_invalid() {
        let buffer = ring(&[header(300, 0)], 8);
        let mut parser = parser_for(&buffer);
        parser.set_put(1);
        let mut handler = Recorder::default();
        assert_eq!(parser.process_command(&mut handler), Err(CommandError::InvalidSize));
        assert_eq!(parser.get(), 0);
    }

    #[test]
    fn deferred_command_is_retried() {
        let buffer = ring(&[header(300, 1), header(301, 1)], 8);
        let mut parser = parser_for(&buffer);
        parser.set_put(2);
        let mut handler = Recorder {
            defer_id: Some(301),
            ..Recorder::default()
        };

        assert_eq!(
            parser.process_all_commands(&mut handler),
            Ok(CommandStatus::DeferUntilLater)
        );
        assert_eq!(parser.get(), 1);

        handler.defer_id = None;
        assert_eq!(parser.process_all_commands(&mut handler), Ok(CommandStatus::Done));
        assert_eq!(parser.get(), 2);
        assert_eq!(handler.seen.len(), 3);
    }

    #[test]
    fn failed_command_is_consumed() {
        let buffer = ring(&[header(300, 2), 0, header(301, 1)], 8);
        let mut parser = parser_for(&buffer);
        parser.set_put(3);
        let mut handler = Recorder {
            fail_id: Some(300),
            ..Recorder::default()
        };

        assert_eq!(
            parser.process_all_commands(&mut handler),
            Err(CommandError::InvalidArguments("scripted failure"))
        );
        assert_eq!(parser.get(), 2);
    }

    #[test]
    fn jumps_are_validated() {
        let buffer = ring(&[header(300, 1), header(301, 1), header(302, 1)], 8);
        let mut parser = parser_for(&buffer);
        parser.set_put(3);
        let mut handler = Recorder {
            jump: Some((300, 2)),
            ..Recorder::default()
        };
        assert_eq!(parser.process_command(&mut handler), Ok(CommandStatus::Jump(2)));
        assert_eq!(parser.get(), 2);

        parser.set_get(0);
        handler.jump = Some((300, 8));
        assert_eq!(parser.process_command(&mut handler), Err(CommandError::OutOfBounds));
        assert_eq!(parser.get(), 0);
    }

    #[test]
    fn get_wraps_at_the_end_of_the_ring() {
        let buffer = ring(&[header(300, 1)], 4);
        buffer.write_u32(8, header(301, 2)).unwrap();
        let mut parser = parser_for(&buffer);
        parser.set_get(2);
        parser.set_put(1);
        let mut handler = Recorder::default();

        assert_eq!(parser.process_all_commands(&mut handler), Ok(CommandStatus::Done));
        assert_eq!(handler.seen.iter().map(|s| s.0).collect::<Vec<_>>(), vec![301, 300]);
        assert_eq!(parser.get(), 1);
    }

    #[test]
    fn put_at_the_end_of_the_ring_stops_there() {
        let buffer = ring(&[header(300, 1)], 4);
        buffer.write_u32(12, header(301, 1)).unwrap();
        let mut parser = parser_for(&buffer);
        parser.set_get(3);
        parser.set_put(4);
        let mut handler = Recorder::default();

        assert_eq!(parser.process_all_commands(&mut handler), Ok(CommandStatus::Done));
        assert_eq!(parser.get(), 4);
        assert_eq!(handler.seen.len(), 1);

        // Moving put on resumes from the start of the ring.
        parser.set_put(1);
        assert_eq!(parser.get(), 0);
        assert_eq!(parser.process_all_commands(&mut handler), Ok(CommandStatus::Done));
        assert_eq!(handler.seen.iter().map(|s| s.0).collect::<Vec<_>>(), vec![301, 300]);
    }
}
