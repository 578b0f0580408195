//! In-flight command records and the caller callbacks attached to them.

use std::ops::{BitOr, BitOrAssign};

use nix::errno::Errno;

use crate::buffer::BufferHold;
use crate::error::{CallbackError, Error};
use crate::protocol::{
    NBD_CMD_FLAG_DF, NBD_CMD_FLAG_FAST_ZERO, NBD_CMD_FLAG_FUA, NBD_CMD_FLAG_NO_HOLE,
    NBD_CMD_FLAG_REQ_ONE, NbdCommand,
};

/// Flags sent with a transmission request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u16);

impl CommandFlags {
    pub const NONE: Self = Self(0);
    /// Force unit access: data is on stable storage before the reply.
    pub const FUA: Self = Self(NBD_CMD_FLAG_FUA);
    /// Write zeroes without punching holes.
    pub const NO_HOLE: Self = Self(NBD_CMD_FLAG_NO_HOLE);
    /// Read must arrive as a single data chunk.
    pub const DF: Self = Self(NBD_CMD_FLAG_DF);
    /// Block status reply limited to one extent.
    pub const REQ_ONE: Self = Self(NBD_CMD_FLAG_REQ_ONE);
    /// Fail write-zeroes unless it is faster than writing.
    pub const FAST_ZERO: Self = Self(NBD_CMD_FLAG_FAST_ZERO);

    const ALL: u16 = NBD_CMD_FLAG_FUA
        | NBD_CMD_FLAG_NO_HOLE
        | NBD_CMD_FLAG_DF
        | NBD_CMD_FLAG_REQ_ONE
        | NBD_CMD_FLAG_FAST_ZERO;

    pub fn from_bits(bits: u16) -> Option<Self> {
        (bits & !Self::ALL == 0).then_some(Self(bits))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CommandFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommandFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How a read chunk reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Payload bytes transmitted by the server.
    Data,
    /// A zero-filled range with no payload on the wire.
    Hole,
}

/// A run of uniform block status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub length: u32,
    pub status: u32,
}

/// Error slot handed to callbacks.
///
/// `current` shows the error already recorded on the command, if any. A
/// callback aborts its command by calling [`ErrorCell::set`] or by returning
/// an error; only the first error recorded on a command is kept.
#[derive(Debug, Default)]
pub struct ErrorCell {
    current: Option<Errno>,
    raised: Option<CallbackError>,
}

impl ErrorCell {
    pub(crate) fn new(current: Option<Errno>) -> Self {
        Self {
            current,
            raised: None,
        }
    }

    /// The command's error so far, including one set through this cell.
    pub fn get(&self) -> Option<Errno> {
        self.raised.as_ref().map(|e| e.errno).or(self.current)
    }

    pub fn set(&mut self, error: impl Into<CallbackError>) {
        if self.raised.is_none() {
            self.raised = Some(error.into());
        }
    }

    pub(crate) fn into_raised(self) -> Option<CallbackError> {
        self.raised
    }
}

/// What to do with a command once its completion callback has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// Drop the command immediately; it can no longer be queried.
    Retire,
    /// Keep the command until [`crate::Handle::aio_command_completed`]
    /// collects it.
    Keep,
}

/// Invoked for each read chunk after it has been applied to the buffer, with
/// the chunk bytes, the chunk's absolute export offset and its kind.
pub type ChunkCallback =
    Box<dyn FnMut(&[u8], u64, ChunkKind, &mut ErrorCell) -> Result<(), CallbackError> + Send>;

/// Invoked for each block status reply with the context name, the absolute
/// offset of the first extent and the decoded extents.
pub type ExtentCallback =
    Box<dyn FnMut(&str, u64, &[Extent], &mut ErrorCell) -> Result<(), CallbackError> + Send>;

/// Invoked once when a command has been fully answered.
pub type CompletionCallback = Box<dyn FnMut(&mut ErrorCell) -> CompletionAction + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandState {
    InFlight,
    Completed,
}

pub(crate) struct Command {
    pub cookie: u64,
    pub kind: NbdCommand,
    pub offset: u64,
    pub length: u32,
    pub flags: CommandFlags,
    pub buffer: Option<BufferHold>,
    pub chunk: Option<ChunkCallback>,
    pub extent: Option<ExtentCallback>,
    pub completion: Option<CompletionCallback>,
    pub state: CommandState,
    pub error: Option<Error>,
}

impl Command {
    pub(crate) fn new(kind: NbdCommand, offset: u64, length: u32, flags: CommandFlags) -> Self {
        Self {
            cookie: 0,
            kind,
            offset,
            length,
            flags,
            buffer: None,
            chunk: None,
            extent: None,
            completion: None,
            state: CommandState::InFlight,
            error: None,
        }
    }

    pub(crate) fn with_buffer(mut self, buffer: BufferHold) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub(crate) fn with_chunk(mut self, chunk: Option<ChunkCallback>) -> Self {
        self.chunk = chunk;
        self
    }

    pub(crate) fn with_extent(mut self, extent: Option<ExtentCallback>) -> Self {
        self.extent = extent;
        self
    }

    pub(crate) fn with_completion(mut self, completion: Option<CompletionCallback>) -> Self {
        self.completion = completion;
        self
    }

    pub(crate) fn errno(&self) -> Option<Errno> {
        self.error.as_ref().map(Error::errno)
    }

    /// Record `error` unless an earlier one is already kept.
    pub(crate) fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Whether `[offset, offset + len)` lies within the request.
    pub(crate) fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= self.offset + self.length as u64)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == CommandState::Completed
    }

    /// Run the chunk callback for a read chunk.
    pub(crate) fn on_chunk(&mut self, data: &[u8], offset: u64, kind: ChunkKind) {
        let Some(callback) = self.chunk.as_mut() else {
            return;
        };
        let mut cell = ErrorCell::new(self.error.as_ref().map(Error::errno));
        let result = callback(data, offset, kind, &mut cell);
        self.absorb(result, cell);
    }

    /// Run the extent callback for one block status reply.
    pub(crate) fn on_extents(&mut self, context: &str, extents: &[Extent]) {
        let Some(callback) = self.extent.as_mut() else {
            return;
        };
        let mut cell = ErrorCell::new(self.error.as_ref().map(Error::errno));
        let result = callback(context, self.offset, extents, &mut cell);
        self.absorb(result, cell);
    }

    /// Mark the command answered and run its completion callback.
    pub(crate) fn complete(&mut self) -> CompletionAction {
        self.state = CommandState::Completed;
        self.buffer = None;
        self.chunk = None;
        self.extent = None;
        let Some(mut callback) = self.completion.take() else {
            return CompletionAction::Keep;
        };
        let mut cell = ErrorCell::new(self.errno());
        let action = callback(&mut cell);
        if let Some(raised) = cell.into_raised() {
            self.fail(Error::Callback(raised));
        }
        action
    }

    fn absorb(&mut self, result: Result<(), CallbackError>, cell: ErrorCell) {
        if let Err(e) = result {
            self.fail(Error::Callback(e));
        }
        if let Some(raised) = cell.into_raised() {
            self.fail(Error::Callback(raised));
        }
    }
}
