//! Connection state and the transmission-phase command pipeline.
//!
//! Nothing here blocks or spawns: bytes move only inside
//! [`Connection::notify_read`], [`Connection::notify_write`] and
//! [`Connection::poll`], which the caller drives. Outbound frames are queued
//! in `wbuf` and flushed when the transport is writable; inbound bytes
//! accumulate in `rbuf` and are parsed a whole frame at a time.

use std::collections::BTreeMap;
use std::io;

use bytes::{Buf, BytesMut};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace, warn};

use crate::command::{ChunkKind, Command, CompletionAction, Extent};
use crate::config::{HandleConfig, HandshakeFlags, StrictMode, TlsMode};
use crate::debug::DebugSink;
use crate::error::{Error, Result};
use crate::meta::MetaContexts;
use crate::negotiate::{ExportInfo, Outcome, Protocol, Round, Step};
use crate::protocol::*;
use crate::stats::Stats;
use crate::transport::{TlsUpgrade, Transport};
use crate::uri::NbdUri;

const RECV_CHUNK_BYTES: usize = 64 * 1024;

/// Largest structured chunk accepted: a full read payload plus its offset.
const STRUCTURED_CHUNK_MAX_BYTES: usize = MAX_REQUEST_SIZE as usize + 8;

/// Readiness the engine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    Read,
    Write,
    Both,
}

impl Direction {
    fn new(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => Self::None,
            (true, false) => Self::Read,
            (false, true) => Self::Write,
            (true, true) => Self::Both,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

/// Coarse connection state reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport attached yet.
    Created,
    /// Handshake or an option exchange in progress.
    Connecting,
    /// Idle in option mode, waiting for the next `opt_*` call.
    Negotiating,
    /// Transmission phase with nothing in flight.
    Ready,
    /// Transmission phase with commands in flight or bytes queued.
    Processing,
    Closed,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Greeting,
    Negotiating,
    Ready,
    Closed,
    Dead,
}

impl Phase {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Greeting => "connecting",
            Phase::Negotiating => "negotiating",
            Phase::Ready => "ready",
            Phase::Closed => "closed",
            Phase::Dead => "dead",
        }
    }
}

/// Caller settings that shape the handshake and local request checks.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub export_name: String,
    pub tls: TlsMode,
    pub request_structured_replies: bool,
    pub request_meta_context: bool,
    pub opt_mode: bool,
    pub full_info: bool,
    pub handshake_flags: HandshakeFlags,
    pub strict: StrictMode,
}

impl From<&HandleConfig> for Settings {
    fn from(config: &HandleConfig) -> Self {
        Self {
            export_name: config.export_name.clone(),
            tls: config.tls,
            request_structured_replies: config.request_structured_replies,
            request_meta_context: config.request_meta_context,
            opt_mode: config.opt_mode,
            full_info: config.full_info,
            handshake_flags: config.handshake_flags,
            strict: config.strict,
        }
    }
}

/// What the server agreed to during the handshake.
#[derive(Debug, Default)]
pub(crate) struct Negotiated {
    pub protocol: Option<Protocol>,
    pub server_flags: u16,
    pub client_flags: u32,
    pub structured_replies: bool,
    pub tls: bool,
}

pub(crate) struct Connection {
    pub settings: Settings,
    pub negotiated: Negotiated,
    pub meta: MetaContexts,
    pub export: Option<ExportInfo>,
    pub stats: Stats,
    pub debug: DebugSink,
    pub tls_upgrade: Option<Box<dyn TlsUpgrade>>,
    /// Host name presented during the TLS handshake.
    pub server_name: Option<String>,
    pub uri: Option<NbdUri>,
    pub phase: Phase,
    /// Option exchange in progress, if any.
    pub round: Option<Round>,
    /// Result of the most recently finished option exchange.
    pub outcome: Option<Result<Outcome>>,
    pub transport: Option<Box<dyn Transport>>,
    pub rbuf: BytesMut,
    pub wbuf: BytesMut,
    commands: BTreeMap<u64, Command>,
    next_cookie: u64,
    disconnecting: bool,
    write_shut: bool,
}

impl Connection {
    pub(crate) fn new(config: &HandleConfig) -> Self {
        let mut meta = MetaContexts::default();
        for name in &config.meta_contexts {
            meta.request(name);
        }
        let mut debug = DebugSink::default();
        debug.set_enabled(config.debug);
        Self {
            settings: Settings::from(config),
            negotiated: Negotiated::default(),
            meta,
            export: None,
            stats: Stats::default(),
            debug,
            tls_upgrade: None,
            server_name: None,
            uri: None,
            phase: Phase::Created,
            round: None,
            outcome: None,
            transport: None,
            rbuf: BytesMut::with_capacity(RECV_CHUNK_BYTES),
            wbuf: BytesMut::new(),
            commands: BTreeMap::new(),
            next_cookie: 0,
            disconnecting: false,
            write_shut: false,
        }
    }

    pub(crate) fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.phase.name(),
        }
    }

    /// Attach a freshly established transport and start the handshake.
    pub(crate) fn attach(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.phase != Phase::Created {
            return Err(self.invalid_state("connect"));
        }
        self.transport = Some(transport);
        self.phase = Phase::Greeting;
        self.round = Some(Round::handshake());
        self.outcome = None;
        self.debug
            .emit("connect", format_args!("waiting for server greeting"));
        Ok(())
    }

    /// Queue one protocol frame.
    pub(crate) fn queue_frame(&mut self, header: &[u8], payload: &[u8]) {
        self.wbuf.reserve(header.len() + payload.len());
        self.wbuf.extend_from_slice(header);
        self.wbuf.extend_from_slice(payload);
        self.stats.record_sent_chunk();
    }

    pub(crate) fn direction(&self) -> Direction {
        let write = !self.wbuf.is_empty();
        let read = match self.phase {
            Phase::Greeting => true,
            Phase::Negotiating => self.round.is_some(),
            Phase::Ready => self.disconnecting || self.in_flight() > 0,
            Phase::Created | Phase::Closed | Phase::Dead => false,
        };
        Direction::new(read, write)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Created => ConnectionState::Created,
            Phase::Greeting => ConnectionState::Connecting,
            Phase::Negotiating if self.round.is_some() => ConnectionState::Connecting,
            Phase::Negotiating => ConnectionState::Negotiating,
            Phase::Ready if self.in_flight() == 0 && self.wbuf.is_empty() => {
                ConnectionState::Ready
            }
            Phase::Ready => ConnectionState::Processing,
            Phase::Closed => ConnectionState::Closed,
            Phase::Dead => ConnectionState::Dead,
        }
    }

    fn has_transport(&self) -> bool {
        matches!(
            self.phase,
            Phase::Greeting | Phase::Negotiating | Phase::Ready
        ) && self.transport.is_some()
    }

    /// Read everything available and parse as many frames as are complete.
    pub(crate) fn notify_read(&mut self) -> Result<()> {
        if !self.has_transport() {
            return Err(self.invalid_state("notify_read"));
        }
        let mut eof = false;
        loop {
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            let start = self.rbuf.len();
            self.rbuf.resize(start + RECV_CHUNK_BYTES, 0);
            match transport.recv(&mut self.rbuf[start..]) {
                Ok(0) => {
                    self.rbuf.truncate(start);
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.rbuf.truncate(start + n);
                    self.stats.record_received_bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.rbuf.truncate(start);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.rbuf.truncate(start);
                }
                Err(e) => {
                    self.rbuf.truncate(start);
                    return Err(self.die(e.into()));
                }
            }
        }

        if let Err(e) = self.process_input() {
            return Err(self.die(e));
        }
        if eof && self.has_transport() {
            return self.on_eof();
        }
        Ok(())
    }

    /// Send as much queued output as the transport accepts.
    pub(crate) fn notify_write(&mut self) -> Result<()> {
        if !self.has_transport() {
            return Err(self.invalid_state("notify_write"));
        }
        while !self.wbuf.is_empty() {
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            match transport.send(&self.wbuf) {
                Ok(0) => {
                    return Err(self.die(
                        io::Error::new(io::ErrorKind::WriteZero, "transport accepted no bytes")
                            .into(),
                    ));
                }
                Ok(n) => {
                    self.wbuf.advance(n);
                    self.stats.record_sent_bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.die(e.into())),
            }
        }
        if self.wbuf.is_empty() && self.disconnecting && !self.write_shut {
            self.write_shut = true;
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.shutdown_write() {
                    debug!(error = %e, "shutdown of write side failed");
                }
            }
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (-1 waits forever) for the transport to become
    /// ready in the current direction, then make progress. Returns whether
    /// any event was handled.
    pub(crate) fn poll(&mut self, timeout_ms: i32) -> Result<bool> {
        let direction = self.direction();
        if direction == Direction::None || !self.has_transport() {
            return Err(self.invalid_state("poll"));
        }

        let revents = {
            let Some(transport) = self.transport.as_ref() else {
                return Err(self.invalid_state("poll"));
            };
            if direction.is_read() && transport.pending() {
                PollFlags::POLLIN
            } else {
                let mut events = PollFlags::empty();
                if direction.is_read() {
                    events |= PollFlags::POLLIN;
                }
                if direction.is_write() {
                    events |= PollFlags::POLLOUT;
                }
                let timeout = if timeout_ms < 0 {
                    PollTimeout::NONE
                } else {
                    PollTimeout::try_from(timeout_ms)
                        .map_err(|_| Error::invalid_argument("poll timeout out of range"))?
                };
                let mut fds = [PollFd::new(transport.as_fd(), events)];
                match nix::poll::poll(&mut fds, timeout) {
                    Ok(0) => return Ok(false),
                    Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                    Err(Errno::EINTR) => return Ok(false),
                    Err(e) => return Err(io::Error::from(e).into()),
                }
            }
        };

        trace!(?revents, "poll");
        if revents.intersects(PollFlags::POLLOUT) {
            self.notify_write()?;
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            && self.has_transport()
        {
            self.notify_read()?;
        }
        if revents.intersects(PollFlags::POLLNVAL) {
            return Err(self.die(io::Error::from(Errno::EBADF).into()));
        }
        Ok(true)
    }

    /// Block until `done` holds, the connection ends, or an error occurs.
    pub(crate) fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> Result<()> {
        while !done(self) {
            match self.phase {
                Phase::Closed => return Err(NbdError::ConnectionClosed.into()),
                Phase::Dead | Phase::Created => return Err(self.invalid_state("poll")),
                _ => {}
            }
            self.poll(-1)?;
        }
        Ok(())
    }

    fn process_input(&mut self) -> Result<()> {
        loop {
            let progressed = match self.phase {
                Phase::Greeting => self.parse_greeting()?,
                Phase::Negotiating => self.parse_option_reply()?,
                Phase::Ready => self.parse_reply()?,
                Phase::Created | Phase::Closed | Phase::Dead => false,
            };
            if !progressed || self.rbuf.is_empty() {
                return Ok(());
            }
        }
    }

    fn on_eof(&mut self) -> Result<()> {
        let step = self.round.as_ref().map(|r| r.step);
        if self.disconnecting || step == Some(Step::Abort) {
            self.debug
                .emit("close", format_args!("server closed the connection"));
            self.finish_closed();
            return Ok(());
        }
        let err = if step == Some(Step::ExportName) {
            NbdError::UnknownExport {
                name: self.settings.export_name.clone(),
            }
        } else if self.in_flight() > 0 {
            NbdError::ConnectionLost
        } else {
            NbdError::ConnectionClosed
        };
        Err(self.die(err.into()))
    }

    /// Move to the terminal failed state. Every in-flight command completes
    /// with a connection-lost error. Returns `err` for propagation.
    pub(crate) fn die(&mut self, err: Error) -> Error {
        if self.phase == Phase::Dead {
            return err;
        }
        warn!(error = %err, state = self.phase.name(), "connection failed");
        self.debug
            .emit("dead", format_args!("connection failed: {err}"));
        self.phase = Phase::Dead;
        self.round = None;
        self.fail_in_flight();
        self.close_transport();
        err
    }

    /// Orderly end of the connection.
    pub(crate) fn finish_closed(&mut self) {
        if let Some(round) = self.round.take() {
            if round.step == Step::Abort {
                self.outcome = Some(Ok(Outcome::Done));
            }
        }
        self.phase = Phase::Closed;
        self.fail_in_flight();
        self.close_transport();
    }

    pub(crate) fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                warn!(error = %e, "failed to close transport");
            }
        }
        self.wbuf.clear();
        self.rbuf.clear();
    }

    fn fail_in_flight(&mut self) {
        let cookies: Vec<u64> = self
            .commands
            .values()
            .filter(|c| !c.is_done())
            .map(|c| c.cookie)
            .collect();
        for cookie in cookies {
            if let Some(cmd) = self.commands.get_mut(&cookie) {
                cmd.fail(NbdError::ConnectionLost.into());
            }
            self.finish_command(cookie);
        }
    }

    // Transmission phase.

    pub(crate) fn ensure_transmission(&self, operation: &'static str) -> Result<()> {
        if self.phase != Phase::Ready {
            return Err(self.invalid_state(operation));
        }
        if self.disconnecting {
            return Err(Error::InvalidState {
                operation,
                state: "disconnecting",
            });
        }
        Ok(())
    }

    /// Validate, frame and queue a command. Returns its cookie.
    pub(crate) fn submit(&mut self, mut cmd: Command, payload: Option<&[u8]>) -> Result<u64> {
        self.ensure_transmission(cmd.kind.name())?;
        self.check_request(&cmd)?;

        self.next_cookie += 1;
        let cookie = self.next_cookie;
        cmd.cookie = cookie;
        let request = NbdRequest {
            flags: cmd.flags.bits(),
            command: cmd.kind,
            cookie,
            offset: cmd.offset,
            length: cmd.length,
        };
        self.queue_frame(&request.to_bytes(), payload.unwrap_or(&[]));
        trace!(
            cookie,
            command = cmd.kind.name(),
            offset = cmd.offset,
            length = cmd.length,
            "queued request"
        );
        self.debug.emit(
            cmd.kind.name(),
            format_args!(
                "queued {} cookie={} offset={} length={}",
                cmd.kind.name(),
                cookie,
                cmd.offset,
                cmd.length
            ),
        );
        self.commands.insert(cookie, cmd);

        // A failed flush has already failed the command; its error surfaces
        // through aio_command_completed.
        if let Err(e) = self.notify_write() {
            debug!(cookie, error = %e, "write failed after queueing request");
        }
        Ok(cookie)
    }

    fn check_request(&self, cmd: &Command) -> Result<()> {
        let export = self.export.as_ref().ok_or(Error::NoExportInfo)?;
        let strict = &self.settings.strict;
        let length = cmd.length as u64;

        if matches!(cmd.kind, NbdCommand::Read | NbdCommand::Write)
            && cmd.length > MAX_REQUEST_SIZE
        {
            return Err(Error::invalid_argument(format!(
                "request length {} exceeds maximum {}",
                cmd.length, MAX_REQUEST_SIZE
            )));
        }

        if matches!(
            cmd.kind,
            NbdCommand::Write | NbdCommand::Trim | NbdCommand::WriteZeroes
        ) && export.is_read_only()
        {
            return Err(Error::ReadOnly);
        }

        if strict.commands {
            let advertised = match cmd.kind {
                NbdCommand::Flush => Some((NBD_FLAG_SEND_FLUSH, "flush")),
                NbdCommand::Trim => Some((NBD_FLAG_SEND_TRIM, "trim")),
                NbdCommand::WriteZeroes => Some((NBD_FLAG_SEND_WRITE_ZEROES, "write zeroes")),
                NbdCommand::Cache => Some((NBD_FLAG_SEND_CACHE, "cache")),
                _ => None,
            };
            if let Some((flag, feature)) = advertised {
                if !export.has_flag(flag) {
                    return Err(Error::NotSupported { feature });
                }
            }
            if cmd.kind == NbdCommand::BlockStatus
                && !self.meta.negotiated().is_some_and(|n| !n.is_empty())
            {
                return Err(Error::NotSupported {
                    feature: "block status without a negotiated meta context",
                });
            }
        }

        if strict.flags {
            use crate::command::CommandFlags as F;
            let allowed = match cmd.kind {
                NbdCommand::Read => F::DF,
                NbdCommand::Write | NbdCommand::Trim => F::FUA,
                NbdCommand::WriteZeroes => F::FUA | F::NO_HOLE | F::FAST_ZERO,
                NbdCommand::BlockStatus => F::REQ_ONE,
                NbdCommand::Flush | NbdCommand::Cache | NbdCommand::Disconnect => F::NONE,
            };
            if !allowed.contains(cmd.flags) {
                return Err(Error::invalid_argument(format!(
                    "flags {:#x} are not valid for {}",
                    cmd.flags.bits(),
                    cmd.kind.name()
                )));
            }
            if cmd.flags.contains(F::FUA) && !export.has_flag(NBD_FLAG_SEND_FUA) {
                return Err(Error::NotSupported { feature: "FUA" });
            }
            if cmd.flags.contains(F::DF)
                && (!export.has_flag(NBD_FLAG_SEND_DF) || !self.negotiated.structured_replies)
            {
                return Err(Error::NotSupported {
                    feature: "don't-fragment reads",
                });
            }
            if cmd.flags.contains(F::FAST_ZERO) && !export.has_flag(NBD_FLAG_SEND_FAST_ZERO) {
                return Err(Error::NotSupported {
                    feature: "fast zero",
                });
            }
        }

        if cmd.kind == NbdCommand::Flush {
            return Ok(());
        }

        if strict.zero_size && length == 0 {
            return Err(Error::invalid_argument("request length is zero"));
        }

        if strict.bounds
            && cmd
                .offset
                .checked_add(length)
                .is_none_or(|end| end > export.size)
        {
            return Err(Error::OutOfBounds {
                offset: cmd.offset,
                length,
                size: export.size,
            });
        }

        if strict.align {
            if let Some(block) = export.block_size {
                let min = block.minimum.max(1) as u64;
                if cmd.offset % min != 0 || length % min != 0 {
                    return Err(Error::invalid_argument(format!(
                        "request is not aligned to the {min}-byte minimum block size"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse one reply frame. Returns false when more bytes are needed.
    fn parse_reply(&mut self) -> Result<bool> {
        if self.rbuf.len() < 4 {
            return Ok(false);
        }
        match be32(&self.rbuf[0..4]) {
            NBD_SIMPLE_REPLY_MAGIC => self.parse_simple_reply(),
            NBD_STRUCTURED_REPLY_MAGIC => self.parse_structured_reply(),
            magic => Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            }
            .into()),
        }
    }

    fn parse_simple_reply(&mut self) -> Result<bool> {
        if self.rbuf.len() < NbdReply::SIZE_BYTES {
            return Ok(false);
        }
        let reply = NbdReply::from_bytes(&header_bytes(&self.rbuf)?)?;
        let Some(cmd) = self.commands.get(&reply.cookie) else {
            return Err(NbdError::UnknownCookie {
                cookie: reply.cookie,
            }
            .into());
        };
        if cmd.is_done() {
            return Err(NbdError::unexpected(format!(
                "second reply for cookie {}",
                reply.cookie
            ))
            .into());
        }

        let data_len = if cmd.kind == NbdCommand::Read && reply.error == NBD_OK {
            cmd.length as usize
        } else {
            0
        };
        if self.rbuf.len() < NbdReply::SIZE_BYTES + data_len {
            return Ok(false);
        }
        let mut frame = self.rbuf.split_to(NbdReply::SIZE_BYTES + data_len);
        frame.advance(NbdReply::SIZE_BYTES);
        self.stats.record_received_chunk();
        trace!(cookie = reply.cookie, error = reply.error, "simple reply");

        if let Some(cmd) = self.commands.get_mut(&reply.cookie) {
            if reply.error != NBD_OK {
                cmd.fail(Error::Command {
                    errno: errno_of_nbd_error(reply.error),
                    message: None,
                });
            } else if data_len > 0 {
                let offset = cmd.offset;
                apply_data(cmd, offset, &frame);
            }
        }
        self.finish_command(reply.cookie);
        Ok(true)
    }

    fn parse_structured_reply(&mut self) -> Result<bool> {
        if !self.negotiated.structured_replies {
            return Err(NbdError::unexpected("structured reply without negotiation").into());
        }
        if self.rbuf.len() < StructuredReplyHeader::SIZE_BYTES {
            return Ok(false);
        }
        let header = StructuredReplyHeader::from_bytes(&header_bytes(&self.rbuf)?)?;
        let len = header.length as usize;
        if len > STRUCTURED_CHUNK_MAX_BYTES {
            return Err(NbdError::unexpected(format!("structured chunk of {len} bytes")).into());
        }
        if self.rbuf.len() < StructuredReplyHeader::SIZE_BYTES + len {
            return Ok(false);
        }
        let mut frame = self
            .rbuf
            .split_to(StructuredReplyHeader::SIZE_BYTES + len);
        frame.advance(StructuredReplyHeader::SIZE_BYTES);
        let payload = frame.freeze();
        self.stats.record_received_chunk();
        trace!(
            cookie = header.cookie,
            reply_type = header.reply_type,
            length = len,
            done = header.is_done(),
            "structured chunk"
        );

        let Some(cmd) = self.commands.get_mut(&header.cookie) else {
            return Err(NbdError::UnknownCookie {
                cookie: header.cookie,
            }
            .into());
        };
        if cmd.is_done() {
            return Err(NbdError::unexpected(format!(
                "chunk after final reply for cookie {}",
                header.cookie
            ))
            .into());
        }
        apply_structured_chunk(cmd, &self.meta, &mut self.debug, &header, &payload)?;
        if header.is_done() {
            self.finish_command(header.cookie);
        }
        Ok(true)
    }

    /// Mark a command answered; drop it if its completion callback says so.
    fn finish_command(&mut self, cookie: u64) {
        let Some(cmd) = self.commands.get_mut(&cookie) else {
            return;
        };
        let action = cmd.complete();
        match &cmd.error {
            Some(e) => debug!(cookie, error = %e, "command failed"),
            None => trace!(cookie, "command complete"),
        }
        if action == CompletionAction::Retire {
            self.commands.remove(&cookie);
        }
    }

    /// `Ok(false)` while in flight; once completed, retires the command and
    /// returns `Ok(true)` or its error.
    pub(crate) fn command_completed(&mut self, cookie: u64) -> Result<bool> {
        match self.commands.get(&cookie) {
            None => Err(Error::UnknownCookie { cookie }),
            Some(cmd) if !cmd.is_done() => Ok(false),
            Some(_) => match self.commands.remove(&cookie).and_then(|c| c.error) {
                Some(err) => Err(err),
                None => Ok(true),
            },
        }
    }

    /// Lowest cookie of a completed, not yet collected command.
    pub(crate) fn peek_completed(&self) -> Option<u64> {
        self.commands
            .values()
            .find(|c| c.is_done())
            .map(|c| c.cookie)
    }

    /// Whether `cookie` has been answered (or retired already).
    pub(crate) fn command_done(&self, cookie: u64) -> bool {
        self.commands.get(&cookie).is_none_or(Command::is_done)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.commands.values().filter(|c| !c.is_done()).count()
    }

    /// Queue NBD_CMD_DISCONNECT. Replies to earlier commands are still
    /// processed until the server closes the connection.
    pub(crate) fn disconnect(&mut self) -> Result<()> {
        if self.phase != Phase::Ready {
            return Err(self.invalid_state("disconnect"));
        }
        if self.disconnecting {
            return Ok(());
        }
        self.next_cookie += 1;
        let request = NbdRequest {
            flags: 0,
            command: NbdCommand::Disconnect,
            cookie: self.next_cookie,
            offset: 0,
            length: 0,
        };
        self.queue_frame(&request.to_bytes(), &[]);
        self.disconnecting = true;
        self.debug
            .emit("disconnect", format_args!("sent disconnect request"));
        self.notify_write()
    }
}

fn header_bytes<const N: usize>(buf: &[u8]) -> Result<[u8; N]> {
    buf.get(..N)
        .and_then(|b| <[u8; N]>::try_from(b).ok())
        .ok_or_else(|| NbdError::unexpected("short frame header").into())
}

/// Copy read data into the command's buffer and report it to the chunk
/// callback.
fn apply_data(cmd: &mut Command, offset: u64, data: &[u8]) {
    let at = (offset - cmd.offset) as usize;
    if let Some(buffer) = cmd.buffer.as_ref() {
        if let Err(e) = buffer.write(at, data) {
            cmd.fail(e);
            return;
        }
    }
    cmd.on_chunk(data, offset, ChunkKind::Data);
}

fn apply_hole(cmd: &mut Command, offset: u64, len: u32) {
    let at = (offset - cmd.offset) as usize;
    if let Some(buffer) = cmd.buffer.as_ref() {
        if let Err(e) = buffer.zero(at, len as usize) {
            cmd.fail(e);
            return;
        }
    }
    if cmd.chunk.is_some() {
        let zeroes = vec![0u8; len as usize];
        cmd.on_chunk(&zeroes, offset, ChunkKind::Hole);
    }
}

fn protocol_failure(cmd: &mut Command, reason: String) {
    cmd.fail(Error::Command {
        errno: Errno::EPROTO,
        message: Some(reason),
    });
}

/// Apply one structured reply chunk to its command. Chunk-level protocol
/// violations fail only the owning command.
fn apply_structured_chunk(
    cmd: &mut Command,
    meta: &MetaContexts,
    debug: &mut DebugSink,
    header: &StructuredReplyHeader,
    payload: &[u8],
) -> Result<()> {
    match header.reply_type {
        NBD_REPLY_TYPE_NONE => {
            if !payload.is_empty() || !header.is_done() {
                return Err(NbdError::unexpected("NBD_REPLY_TYPE_NONE must be final and empty").into());
            }
        }
        NBD_REPLY_TYPE_OFFSET_DATA => {
            if cmd.kind != NbdCommand::Read || payload.len() < 9 {
                protocol_failure(cmd, "invalid OFFSET_DATA chunk".into());
                return Ok(());
            }
            let offset = be64(&payload[0..8]);
            let data = &payload[8..];
            if !cmd.covers(offset, data.len() as u64) {
                protocol_failure(cmd, format!("data chunk at {offset} outside request"));
                return Ok(());
            }
            apply_data(cmd, offset, data);
        }
        NBD_REPLY_TYPE_OFFSET_HOLE => {
            if cmd.kind != NbdCommand::Read || payload.len() != 12 {
                protocol_failure(cmd, "invalid OFFSET_HOLE chunk".into());
                return Ok(());
            }
            let offset = be64(&payload[0..8]);
            let len = be32(&payload[8..12]);
            if len == 0 || !cmd.covers(offset, len as u64) {
                protocol_failure(cmd, format!("hole chunk at {offset} outside request"));
                return Ok(());
            }
            apply_hole(cmd, offset, len);
        }
        NBD_REPLY_TYPE_BLOCK_STATUS => {
            if cmd.kind != NbdCommand::BlockStatus
                || payload.len() < 12
                || (payload.len() - 4) % 8 != 0
            {
                protocol_failure(cmd, "invalid BLOCK_STATUS chunk".into());
                return Ok(());
            }
            let id = be32(&payload[0..4]);
            let Some(context) = meta.name_of(id) else {
                debug.emit(
                    "block_status",
                    format_args!("skipping reply for unrequested context id {id}"),
                );
                return Ok(());
            };
            let mut extents: Vec<Extent> = payload[4..]
                .chunks_exact(8)
                .map(|e| Extent {
                    length: be32(&e[0..4]),
                    status: be32(&e[4..8]),
                })
                .collect();
            if cmd.flags.contains(crate::command::CommandFlags::REQ_ONE) {
                extents.truncate(1);
            }
            cmd.on_extents(context, &extents);
        }
        NBD_REPLY_TYPE_ERROR | NBD_REPLY_TYPE_ERROR_OFFSET => {
            if payload.len() < 6 {
                protocol_failure(cmd, "truncated error chunk".into());
                return Ok(());
            }
            let error = be32(&payload[0..4]);
            let msg_len = be16(&payload[4..6]) as usize;
            let tail = if header.reply_type == NBD_REPLY_TYPE_ERROR_OFFSET {
                8
            } else {
                0
            };
            if payload.len() != 6 + msg_len + tail {
                protocol_failure(cmd, "malformed error chunk".into());
                return Ok(());
            }
            let message = String::from_utf8_lossy(&payload[6..6 + msg_len]).into_owned();
            if tail > 0 {
                let offset = be64(&payload[6 + msg_len..]);
                if !cmd.covers(offset, 1) {
                    protocol_failure(cmd, format!("error offset {offset} outside request"));
                    return Ok(());
                }
                debug.emit(
                    cmd.kind.name(),
                    format_args!("server error at offset {offset}: {message}"),
                );
            }
            cmd.fail(Error::Command {
                errno: errno_of_nbd_error(error),
                message: (!message.is_empty()).then_some(message),
            });
        }
        other if reply_type_is_error(other) => {
            protocol_failure(cmd, format!("unknown error chunk type {other}"));
        }
        other => {
            debug.emit(
                cmd.kind.name(),
                format_args!("ignoring unknown chunk type {other}"),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::buffer::Buffer;
    use crate::command::{CommandFlags, ExtentCallback};
    use crate::meta::MetaContext;

    const SIZE: u64 = 1 << 20;

    /// A connection already in transmission, wired to a blocking peer socket.
    fn ready(structured: bool) -> (Connection, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(&HandleConfig::default());
        conn.transport = Some(Box::new(client));
        conn.phase = Phase::Ready;
        conn.negotiated.structured_replies = structured;
        conn.export = Some(ExportInfo {
            size: SIZE,
            flags: NBD_FLAG_HAS_FLAGS
                | NBD_FLAG_SEND_FLUSH
                | NBD_FLAG_SEND_FUA
                | NBD_FLAG_SEND_TRIM
                | NBD_FLAG_SEND_WRITE_ZEROES,
            ..Default::default()
        });
        conn.meta.settle_for_transmission();
        (conn, server)
    }

    fn read_requests(server: &mut UnixStream, n: usize) -> Vec<NbdRequest> {
        (0..n)
            .map(|_| {
                let mut buf = [0u8; NbdRequest::SIZE_BYTES];
                server.read_exact(&mut buf).unwrap();
                NbdRequest::from_bytes(&buf, SIZE).unwrap()
            })
            .collect()
    }

    fn chunk(server: &mut UnixStream, cookie: u64, reply_type: u16, done: bool, payload: &[u8]) {
        let header = StructuredReplyHeader {
            flags: if done { NBD_REPLY_FLAG_DONE } else { 0 },
            reply_type,
            cookie,
            length: payload.len() as u32,
        };
        server.write_all(&header.to_bytes()).unwrap();
        server.write_all(payload).unwrap();
    }

    #[test]
    fn requests_are_validated_locally() {
        let (mut conn, _server) = ready(false);
        let read = |offset, length, flags| Command::new(NbdCommand::Read, offset, length, flags);

        assert!(matches!(
            conn.submit(read(SIZE - 512, 1024, CommandFlags::NONE), None),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            conn.submit(read(0, 0, CommandFlags::NONE), None),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            conn.submit(read(0, MAX_REQUEST_SIZE + 1, CommandFlags::NONE), None),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            conn.submit(read(0, 512, CommandFlags::FUA), None),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            conn.submit(
                Command::new(NbdCommand::Cache, 0, 512, CommandFlags::NONE),
                None
            ),
            Err(Error::NotSupported { .. })
        ));
        assert!(matches!(
            conn.submit(
                Command::new(NbdCommand::BlockStatus, 0, 512, CommandFlags::NONE),
                None
            ),
            Err(Error::NotSupported { .. })
        ));

        if let Some(export) = conn.export.as_mut() {
            export.flags |= NBD_FLAG_READ_ONLY;
        }
        assert!(matches!(
            conn.submit(
                Command::new(NbdCommand::Write, 0, 4, CommandFlags::NONE),
                Some(&[1, 2, 3, 4])
            ),
            Err(Error::ReadOnly)
        ));
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.stats.chunks_sent, 0);
    }

    #[test]
    fn replies_are_matched_by_cookie() {
        let (mut conn, mut server) = ready(false);
        let first = conn
            .submit(Command::new(NbdCommand::Flush, 0, 0, CommandFlags::NONE), None)
            .unwrap();
        let second = conn
            .submit(Command::new(NbdCommand::Flush, 0, 0, CommandFlags::NONE), None)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(conn.direction(), Direction::Read);

        let requests = read_requests(&mut server, 2);
        assert_eq!(requests[0].cookie, first);
        assert_eq!(requests[1].cookie, second);

        server.write_all(&NbdReply::ok(second).to_bytes()).unwrap();
        conn.notify_read().unwrap();
        assert!(!conn.command_completed(first).unwrap());
        assert_eq!(conn.peek_completed(), Some(second));
        assert!(conn.command_completed(second).unwrap());

        server
            .write_all(&NbdReply::error(first, NBD_EPERM).to_bytes())
            .unwrap();
        conn.notify_read().unwrap();
        assert!(matches!(
            conn.command_completed(first),
            Err(Error::Command { errno: Errno::EPERM, .. })
        ));
        assert!(matches!(
            conn.command_completed(first),
            Err(Error::UnknownCookie { .. })
        ));
        assert_eq!(conn.in_flight(), 0);
    }

    #[test]
    fn structured_chunk_for_unknown_cookie_kills_the_connection() {
        let (mut conn, mut server) = ready(true);
        let cookie = conn
            .submit(Command::new(NbdCommand::Flush, 0, 0, CommandFlags::NONE), None)
            .unwrap();
        read_requests(&mut server, 1);

        chunk(&mut server, 999, NBD_REPLY_TYPE_NONE, true, &[]);
        chunk(&mut server, cookie, NBD_REPLY_TYPE_NONE, true, &[]);

        assert!(matches!(
            conn.notify_read(),
            Err(Error::Nbd(NbdError::UnknownCookie { cookie: 999 }))
        ));
        assert_eq!(conn.state(), ConnectionState::Dead);
        assert!(matches!(
            conn.command_completed(cookie),
            Err(Error::Nbd(NbdError::ConnectionLost))
        ));
    }

    #[test]
    fn error_offset_must_lie_inside_the_request() {
        let (mut conn, mut server) = ready(true);
        let read = |offset| Command::new(NbdCommand::Read, offset, 512, CommandFlags::NONE);
        let outside = conn.submit(read(4096), None).unwrap();
        let inside = conn.submit(read(8192), None).unwrap();
        read_requests(&mut server, 2);

        for (cookie, at) in [(outside, 0u64), (inside, 8200)] {
            let mut payload = NBD_EPERM.to_be_bytes().to_vec();
            payload.extend_from_slice(&4u16.to_be_bytes());
            payload.extend_from_slice(b"nope");
            payload.extend_from_slice(&at.to_be_bytes());
            chunk(&mut server, cookie, NBD_REPLY_TYPE_ERROR_OFFSET, true, &payload);
        }
        conn.notify_read().unwrap();

        assert!(matches!(
            conn.command_completed(outside),
            Err(Error::Command { errno: Errno::EPROTO, .. })
        ));
        match conn.command_completed(inside) {
            Err(Error::Command { errno, message }) => {
                assert_eq!(errno, Errno::EPERM);
                assert_eq!(message.as_deref(), Some("nope"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn structured_chunks_land_at_their_own_offsets() {
        let (mut conn, mut server) = ready(true);
        let buffer = Buffer::from_slice(&[0xff; 8]);
        let cmd = Command::new(NbdCommand::Read, 4096, 8, CommandFlags::NONE)
            .with_buffer(buffer.hold());
        let cookie = conn.submit(cmd, None).unwrap();
        read_requests(&mut server, 1);

        let mut data = 4100u64.to_be_bytes().to_vec();
        data.extend_from_slice(b"abcd");
        chunk(&mut server, cookie, NBD_REPLY_TYPE_OFFSET_DATA, false, &data);
        let mut hole = 4096u64.to_be_bytes().to_vec();
        hole.extend_from_slice(&4u32.to_be_bytes());
        chunk(&mut server, cookie, NBD_REPLY_TYPE_OFFSET_HOLE, true, &hole);

        conn.notify_read().unwrap();
        assert!(conn.command_completed(cookie).unwrap());
        assert_eq!(buffer.to_vec(), b"\0\0\0\0abcd");
        assert_eq!(buffer.holds(), 0);
    }

    #[test]
    fn block_status_for_unknown_context_is_skipped() {
        let (mut conn, mut server) = ready(true);
        conn.meta.finish_negotiation(vec![MetaContext {
            id: 1,
            name: CONTEXT_BASE_ALLOCATION.to_string(),
        }]);

        let seen: Arc<Mutex<Vec<(String, Vec<Extent>)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let callback: ExtentCallback = Box::new(move |context, _, extents, _| {
            sink.lock().push((context.to_string(), extents.to_vec()));
            Ok(())
        });
        let cmd = Command::new(NbdCommand::BlockStatus, 0, 4096, CommandFlags::NONE)
            .with_extent(Some(callback));
        let cookie = conn.submit(cmd, None).unwrap();
        read_requests(&mut server, 1);

        for (id, done) in [(9u32, false), (1, true)] {
            let mut payload = id.to_be_bytes().to_vec();
            payload.extend_from_slice(&4096u32.to_be_bytes());
            payload.extend_from_slice(&NBD_STATE_HOLE.to_be_bytes());
            chunk(&mut server, cookie, NBD_REPLY_TYPE_BLOCK_STATUS, done, &payload);
        }
        conn.notify_read().unwrap();
        assert!(conn.command_completed(cookie).unwrap());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, CONTEXT_BASE_ALLOCATION);
        assert_eq!(
            seen[0].1,
            vec![Extent {
                length: 4096,
                status: NBD_STATE_HOLE
            }]
        );
    }

    #[test]
    fn connection_loss_fails_in_flight_commands() {
        let (mut conn, mut server) = ready(false);
        let cookie = conn
            .submit(Command::new(NbdCommand::Flush, 0, 0, CommandFlags::NONE), None)
            .unwrap();
        read_requests(&mut server, 1);
        drop(server);

        assert!(conn.notify_read().is_err());
        assert_eq!(conn.state(), ConnectionState::Dead);
        assert!(matches!(
            conn.command_completed(cookie),
            Err(Error::Nbd(NbdError::ConnectionLost))
        ));
        assert_eq!(conn.direction(), Direction::None);
    }
}
