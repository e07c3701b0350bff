use thiserror::Error;

/// Parse/decode status as published in the shared state.
///
/// The numeric values are part of the cross-process contract.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[default]
    NoError = 0,
    InvalidSize = 1,
    OutOfBounds = 2,
    UnknownCommand = 3,
    InvalidArguments = 4,
    LostContext = 5,
    GenericError = 6,
    DeferCommandUntilLater = 7,
}

impl ErrorCode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::NoError),
            1 => Some(Self::InvalidSize),
            2 => Some(Self::OutOfBounds),
            3 => Some(Self::UnknownCommand),
            4 => Some(Self::InvalidArguments),
            5 => Some(Self::LostContext),
            6 => Some(Self::GenericError),
            7 => Some(Self::DeferCommandUntilLater),
            _ => None,
        }
    }

    /// Whether this code represents a failure.
    ///
    /// `DeferCommandUntilLater` is a retry request, not a failure.
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::NoError | Self::DeferCommandUntilLater)
    }
}

/// Why a context was lost, as published alongside a fatal [`ErrorCode`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContextLostReason {
    /// This context caused the loss.
    Guilty = 0,
    /// Another context caused the loss.
    Innocent = 1,
    #[default]
    Unknown = 2,
    OutOfMemory = 3,
    MakeCurrentFailed = 4,
    GpuChannelLost = 5,
}

impl ContextLostReason {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Guilty),
            1 => Some(Self::Innocent),
            2 => Some(Self::Unknown),
            3 => Some(Self::OutOfMemory),
            4 => Some(Self::MakeCurrentFailed),
            5 => Some(Self::GpuChannelLost),
            _ => None,
        }
    }
}

/// Failure reported while parsing or executing one command.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command header has size 0")]
    InvalidSize,
    #[error("command reads past the end of the command buffer")]
    OutOfBounds,
    #[error("unknown command id {0}")]
    UnknownCommand(u32),
    #[error("invalid arguments: {0}")]
    InvalidArguments(&'static str),
    #[error("context lost")]
    LostContext,
    #[error("{0}")]
    Generic(String),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSize => ErrorCode::InvalidSize,
            Self::OutOfBounds => ErrorCode::OutOfBounds,
            Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Self::InvalidArguments(_) => ErrorCode::InvalidArguments,
            Self::LostContext => ErrorCode::LostContext,
            Self::Generic(_) => ErrorCode::GenericError,
        }
    }
}
