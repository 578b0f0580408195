//! NBD protocol constants and frame codecs.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Protocol constants are defined for completeness even if not all are currently used.

#![allow(dead_code)]

use std::io;

use nix::errno::Errno;
use thiserror::Error;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_OLDSTYLE_MAGIC: u64 = 0x0000420281861253;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;

// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_SEND_DF: u16 = 1 << 7;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;
pub const NBD_FLAG_SEND_RESIZE: u16 = 1 << 9;
pub const NBD_FLAG_SEND_CACHE: u16 = 1 << 10;
pub const NBD_FLAG_SEND_FAST_ZERO: u16 = 1 << 11;

// Option types
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_STARTTLS: u32 = 5;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;
pub const NBD_OPT_LIST_META_CONTEXT: u32 = 9;
pub const NBD_OPT_SET_META_CONTEXT: u32 = 10;

// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_META_CONTEXT: u32 = 4;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR + 1;
pub const NBD_REP_ERR_POLICY: u32 = NBD_REP_FLAG_ERROR + 2;
pub const NBD_REP_ERR_INVALID: u32 = NBD_REP_FLAG_ERROR + 3;
pub const NBD_REP_ERR_PLATFORM: u32 = NBD_REP_FLAG_ERROR + 4;
pub const NBD_REP_ERR_TLS_REQD: u32 = NBD_REP_FLAG_ERROR + 5;
pub const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR + 6;
pub const NBD_REP_ERR_SHUTDOWN: u32 = NBD_REP_FLAG_ERROR + 7;
pub const NBD_REP_ERR_BLOCK_SIZE_REQD: u32 = NBD_REP_FLAG_ERROR + 8;
pub const NBD_REP_ERR_TOO_BIG: u32 = NBD_REP_FLAG_ERROR + 9;

// Info types
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

/// Minimum block size (1 byte).
///
/// Most flexible; clients may align to 512 for portability.
pub const NBD_MIN_BLOCK_SIZE: u32 = 1;

/// Maximum payload size per NBD protocol specification (32 MiB).
///
/// This is the default maximum that portable clients expect servers to support.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024; // 32 MiB

/// Largest request the client will frame or accept a reply for (64 MiB).
///
/// Bounds the memory a single READ/WRITE or structured chunk can pin.
pub const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024; // 64 MiB

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_CACHE: u16 = 5;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;
pub const NBD_CMD_BLOCK_STATUS: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    Cache,
    WriteZeroes,
    BlockStatus,
}

impl NbdCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISCONNECT => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            NBD_CMD_CACHE => Some(Self::Cache),
            NBD_CMD_WRITE_ZEROES => Some(Self::WriteZeroes),
            NBD_CMD_BLOCK_STATUS => Some(Self::BlockStatus),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISCONNECT,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
            Self::Cache => NBD_CMD_CACHE,
            Self::WriteZeroes => NBD_CMD_WRITE_ZEROES,
            Self::BlockStatus => NBD_CMD_BLOCK_STATUS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Disconnect => "disconnect",
            Self::Flush => "flush",
            Self::Trim => "trim",
            Self::Cache => "cache",
            Self::WriteZeroes => "write_zeroes",
            Self::BlockStatus => "block_status",
        }
    }

    /// Whether the request is followed by `length` bytes of payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Write)
    }
}

pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;
pub const NBD_CMD_FLAG_DF: u16 = 1 << 2;
pub const NBD_CMD_FLAG_REQ_ONE: u16 = 1 << 3;
pub const NBD_CMD_FLAG_FAST_ZERO: u16 = 1 << 4;

// Structured reply flags and types
pub const NBD_REPLY_FLAG_DONE: u16 = 1 << 0;

pub const NBD_REPLY_TYPE_NONE: u16 = 0;
pub const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const NBD_REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub const NBD_REPLY_TYPE_BLOCK_STATUS: u16 = 5;
pub const NBD_REPLY_TYPE_ERROR: u16 = (1 << 15) + 1;
pub const NBD_REPLY_TYPE_ERROR_OFFSET: u16 = (1 << 15) + 2;

pub fn reply_type_is_error(reply_type: u16) -> bool {
    reply_type & (1 << 15) != 0
}

// base:allocation extent flags
pub const NBD_STATE_HOLE: u32 = 1 << 0;
pub const NBD_STATE_ZERO: u32 = 1 << 1;

pub const CONTEXT_BASE_ALLOCATION: &str = "base:allocation";

// Error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Map an NBD wire error code to the local errno.
///
/// Unknown codes are reported as `EINVAL`, as the protocol requires.
pub fn errno_of_nbd_error(error: u32) -> Errno {
    match error {
        NBD_OK => Errno::UnknownErrno,
        NBD_EPERM => Errno::EPERM,
        NBD_EIO => Errno::EIO,
        NBD_ENOMEM => Errno::ENOMEM,
        NBD_ENOSPC => Errno::ENOSPC,
        NBD_EOVERFLOW => Errno::EOVERFLOW,
        NBD_ENOTSUP => Errno::ENOTSUP,
        NBD_ESHUTDOWN => Errno::ESHUTDOWN,
        _ => Errno::EINVAL,
    }
}

/// Map a local errno to the NBD wire error code.
pub fn nbd_error_of_errno(errno: Errno) -> u32 {
    match errno {
        Errno::EPERM | Errno::EROFS => NBD_EPERM,
        Errno::EIO => NBD_EIO,
        Errno::ENOMEM => NBD_ENOMEM,
        Errno::ENOSPC | Errno::EDQUOT | Errno::EFBIG => NBD_ENOSPC,
        Errno::EOVERFLOW => NBD_EOVERFLOW,
        Errno::ENOTSUP => NBD_ENOTSUP,
        Errno::ESHUTDOWN => NBD_ESHUTDOWN,
        _ => NBD_EINVAL,
    }
}

pub fn option_name(option: u32) -> &'static str {
    match option {
        NBD_OPT_EXPORT_NAME => "NBD_OPT_EXPORT_NAME",
        NBD_OPT_ABORT => "NBD_OPT_ABORT",
        NBD_OPT_LIST => "NBD_OPT_LIST",
        NBD_OPT_STARTTLS => "NBD_OPT_STARTTLS",
        NBD_OPT_INFO => "NBD_OPT_INFO",
        NBD_OPT_GO => "NBD_OPT_GO",
        NBD_OPT_STRUCTURED_REPLY => "NBD_OPT_STRUCTURED_REPLY",
        NBD_OPT_LIST_META_CONTEXT => "NBD_OPT_LIST_META_CONTEXT",
        NBD_OPT_SET_META_CONTEXT => "NBD_OPT_SET_META_CONTEXT",
        _ => "unknown option",
    }
}

pub fn reply_name(reply: u32) -> &'static str {
    match reply {
        NBD_REP_ACK => "NBD_REP_ACK",
        NBD_REP_SERVER => "NBD_REP_SERVER",
        NBD_REP_INFO => "NBD_REP_INFO",
        NBD_REP_META_CONTEXT => "NBD_REP_META_CONTEXT",
        NBD_REP_ERR_UNSUP => "NBD_REP_ERR_UNSUP",
        NBD_REP_ERR_POLICY => "NBD_REP_ERR_POLICY",
        NBD_REP_ERR_INVALID => "NBD_REP_ERR_INVALID",
        NBD_REP_ERR_PLATFORM => "NBD_REP_ERR_PLATFORM",
        NBD_REP_ERR_TLS_REQD => "NBD_REP_ERR_TLS_REQD",
        NBD_REP_ERR_UNKNOWN => "NBD_REP_ERR_UNKNOWN",
        NBD_REP_ERR_SHUTDOWN => "NBD_REP_ERR_SHUTDOWN",
        NBD_REP_ERR_BLOCK_SIZE_REQD => "NBD_REP_ERR_BLOCK_SIZE_REQD",
        NBD_REP_ERR_TOO_BIG => "NBD_REP_ERR_TOO_BIG",
        _ => "unknown reply",
    }
}

/// Maximum length for option reply data during negotiation.
/// This prevents unbounded allocation from malicious servers.
pub const OPTION_REPLY_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// Length of the reserved padding after an EXPORT_NAME / oldstyle reply.
pub const NBD_ZERO_PAD_BYTES: usize = 124;

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:016x}, got 0x{actual:016x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("protocol negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u16 },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("unknown export: {name}")]
    UnknownExport { name: String },

    #[error("server does not support {}", option_name(*.option))]
    OptionUnsupported { option: u32 },

    #[error("server rejected {} with {}{}", option_name(*.option), reply_name(*.reply), format_message(.message))]
    OptionRejected {
        option: u32,
        reply: u32,
        message: Option<String>,
    },

    #[error("unexpected reply: {reason}")]
    UnexpectedReply { reason: String },

    #[error("no command in flight with cookie {cookie}")]
    UnknownCookie { cookie: u64 },

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("connection lost with command still in flight")]
    ConnectionLost,

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

pub(crate) fn format_message(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(": {m}"),
        _ => String::new(),
    }
}

impl NbdError {
    pub(crate) fn unexpected(reason: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            reason: reason.into(),
        }
    }
}

/// NBD request (28 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: NbdCommand,
    pub cookie: u64,
    pub offset: u64,
    /// Request length, validated based on command type:
    /// - Read/Write: bounded by NBD_MAX_PAYLOAD_SIZE (data transfer)
    /// - Trim/WriteZeroes/Cache/BlockStatus: bounded by device size
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse and validate an NBD request.
    ///
    /// Length validation depends on command type per the NBD protocol:
    /// - Commands that transfer data (Read, Write) are limited to `NBD_MAX_PAYLOAD_SIZE`
    /// - Commands that specify ranges without data transfer can exceed the
    ///   max payload size, bounded only by device size
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES], device_size: u64) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let flags = be16(&buf[4..6]);
        let cmd = be16(&buf[6..8]);
        let command =
            NbdCommand::from_u16(cmd).ok_or(NbdError::UnsupportedCommand { command: cmd })?;
        let cookie = be64(&buf[8..16]);
        let offset = be64(&buf[16..24]);
        let length = be32(&buf[24..28]);

        let max_length = match command {
            NbdCommand::Read | NbdCommand::Write => NBD_MAX_PAYLOAD_SIZE,
            NbdCommand::Trim
            | NbdCommand::WriteZeroes
            | NbdCommand::Cache
            | NbdCommand::BlockStatus => device_size.min(u32::MAX as u64) as u32,
            NbdCommand::Disconnect | NbdCommand::Flush => u32::MAX,
        };

        if length > max_length {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: max_length,
            });
        }

        Ok(Self {
            flags,
            command,
            cookie,
            offset,
            length,
        })
    }
}

/// NBD simple reply (16 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdReply {
    pub error: u32,
    pub cookie: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(cookie: u64) -> Self {
        Self {
            error: NBD_OK,
            cookie,
        }
    }

    pub fn error(cookie: u64, error: u32) -> Self {
        Self { error, cookie }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = be32(&buf[0..4]);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let error = be32(&buf[4..8]);
        let cookie = be64(&buf[8..16]);
        Ok(Self { error, cookie })
    }
}

/// Structured reply chunk header (20 bytes on wire); `length` payload bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredReplyHeader {
    pub flags: u16,
    pub reply_type: u16,
    pub cookie: u64,
    pub length: u32,
}

impl StructuredReplyHeader {
    pub const SIZE_BYTES: usize = 20;

    pub fn is_done(&self) -> bool {
        self.flags & NBD_REPLY_FLAG_DONE != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.reply_type.to_be_bytes());
        buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = be32(&buf[0..4]);
        if magic != NBD_STRUCTURED_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_STRUCTURED_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }
        Ok(Self {
            flags: be16(&buf[4..6]),
            reply_type: be16(&buf[6..8]),
            cookie: be64(&buf[8..16]),
            length: be32(&buf[16..20]),
        })
    }
}

/// Option request header (16 bytes on wire); `length` bytes of option data follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionHeader {
    pub option: u32,
    pub length: u32,
}

impl OptionHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = be64(&buf[0..8]);
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            option: be32(&buf[8..12]),
            length: be32(&buf[12..16]),
        })
    }
}

/// Option reply header (20 bytes on wire); `length` bytes of reply data follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionReplyHeader {
    pub option: u32,
    pub reply: u32,
    pub length: u32,
}

impl OptionReplyHeader {
    pub const SIZE_BYTES: usize = 20;

    pub fn is_error(&self) -> bool {
        self.reply & NBD_REP_FLAG_ERROR != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reply.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = be64(&buf[0..8]);
        if magic != NBD_OPTION_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTION_REPLY_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            option: be32(&buf[8..12]),
            reply: be32(&buf[12..16]),
            length: be32(&buf[16..20]),
        })
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(StructuredReplyHeader::SIZE_BYTES == 20);
    assert!(OptionHeader::SIZE_BYTES == 16);
    assert!(OptionReplyHeader::SIZE_BYTES == 20);
};

// Big-endian field readers. Callers slice exactly the field width.

pub(crate) fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub(crate) fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DEVICE_SIZE: u64 = 1024 * 1024 * 1024; // 1 GiB

    #[test]
    fn request_encodes_fields_big_endian() {
        let req = NbdRequest {
            flags: NBD_CMD_FLAG_FUA,
            command: NbdCommand::Write,
            cookie: 0x0102030405060708,
            offset: 1024,
            length: 512,
        };
        let buf = req.to_bytes();
        assert_eq!(&buf[0..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&buf[4..6], &[0, 1]);
        assert_eq!(&buf[6..8], &[0, 1]);
        assert_eq!(&buf[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let parsed = NbdRequest::from_bytes(&buf, TEST_DEVICE_SIZE).unwrap();
        assert_eq!(parsed.command, NbdCommand::Write);
        assert_eq!(parsed.cookie, 0x0102030405060708);
        assert_eq!(parsed.offset, 1024);
        assert_eq!(parsed.length, 512);
    }

    #[test]
    fn request_invalid_magic() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        let result = NbdRequest::from_bytes(&buf, TEST_DEVICE_SIZE);
        assert!(matches!(result, Err(NbdError::InvalidMagic { .. })));
    }

    #[test]
    fn request_unsupported_command() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[6..8].copy_from_slice(&99u16.to_be_bytes());
        let result = NbdRequest::from_bytes(&buf, TEST_DEVICE_SIZE);
        assert!(matches!(
            result,
            Err(NbdError::UnsupportedCommand { command: 99 })
        ));
    }

    #[test]
    fn request_read_too_large() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[6..8].copy_from_slice(&NBD_CMD_READ.to_be_bytes());
        buf[24..28].copy_from_slice(&(NBD_MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        let result = NbdRequest::from_bytes(&buf, TEST_DEVICE_SIZE);
        assert!(matches!(result, Err(NbdError::RequestTooLarge { .. })));
    }

    #[test]
    fn block_status_allows_large_length() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[6..8].copy_from_slice(&NBD_CMD_BLOCK_STATUS.to_be_bytes());
        buf[24..28].copy_from_slice(&(NBD_MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        let req = NbdRequest::from_bytes(&buf, TEST_DEVICE_SIZE).unwrap();
        assert_eq!(req.command, NbdCommand::BlockStatus);
    }

    #[test]
    fn structured_header_parses_done_flag() {
        let header = StructuredReplyHeader {
            flags: NBD_REPLY_FLAG_DONE,
            reply_type: NBD_REPLY_TYPE_OFFSET_HOLE,
            cookie: 7,
            length: 12,
        };
        let parsed = StructuredReplyHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(parsed.is_done());
        assert_eq!(parsed, header);
    }

    #[test]
    fn simple_reply_rejects_structured_magic() {
        let header = StructuredReplyHeader {
            flags: 0,
            reply_type: NBD_REPLY_TYPE_NONE,
            cookie: 1,
            length: 0,
        };
        let bytes = header.to_bytes();
        let mut simple = [0u8; NbdReply::SIZE_BYTES];
        simple.copy_from_slice(&bytes[..NbdReply::SIZE_BYTES]);
        assert!(matches!(
            NbdReply::from_bytes(&simple),
            Err(NbdError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn error_reply_types() {
        assert!(reply_type_is_error(NBD_REPLY_TYPE_ERROR));
        assert!(reply_type_is_error(NBD_REPLY_TYPE_ERROR_OFFSET));
        assert!(!reply_type_is_error(NBD_REPLY_TYPE_BLOCK_STATUS));
        assert_eq!(NBD_REPLY_TYPE_ERROR, 32769);
    }

    #[test]
    fn option_reply_error_bit() {
        let header = OptionReplyHeader {
            option: NBD_OPT_LIST,
            reply: NBD_REP_ERR_UNSUP,
            length: 0,
        };
        let parsed = OptionReplyHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(parsed.is_error());
        assert_eq!(parsed.option, NBD_OPT_LIST);
    }

    #[test]
    fn nbd_errors_map_to_errno() {
        assert_eq!(errno_of_nbd_error(NBD_EIO), Errno::EIO);
        assert_eq!(errno_of_nbd_error(9999), Errno::EINVAL);
        assert_eq!(nbd_error_of_errno(Errno::EROFS), NBD_EPERM);
        assert_eq!(nbd_error_of_errno(Errno::ENOENT), NBD_EINVAL);
    }

    #[test]
    fn option_rejected_display_includes_message() {
        let err = NbdError::OptionRejected {
            option: NBD_OPT_GO,
            reply: NBD_REP_ERR_UNKNOWN,
            message: Some("no such export".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("NBD_OPT_GO"));
        assert!(text.contains("NBD_REP_ERR_UNKNOWN"));
        assert!(text.contains("no such export"));
    }

    #[test]
    fn all_commands_parse() {
        for (cmd, expected) in [
            (NbdCommand::Read, NBD_CMD_READ),
            (NbdCommand::Write, NBD_CMD_WRITE),
            (NbdCommand::Disconnect, NBD_CMD_DISCONNECT),
            (NbdCommand::Flush, NBD_CMD_FLUSH),
            (NbdCommand::Trim, NBD_CMD_TRIM),
            (NbdCommand::Cache, NBD_CMD_CACHE),
            (NbdCommand::WriteZeroes, NBD_CMD_WRITE_ZEROES),
            (NbdCommand::BlockStatus, NBD_CMD_BLOCK_STATUS),
        ] {
            assert_eq!(cmd.to_u16(), expected);
            assert_eq!(NbdCommand::from_u16(expected), Some(cmd));
        }
    }
}
