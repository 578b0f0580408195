//! The public handle.
//!
//! A [`Handle`] owns one connection. Connecting, option requests and the
//! blocking command wrappers drive the connection to completion themselves;
//! the `aio_*` calls only queue work and leave the caller to report
//! readiness through [`Handle::poll`], [`Handle::aio_notify_read`] or
//! [`Handle::aio_notify_write`].

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::buffer::Buffer;
use crate::command::{ChunkCallback, Command, CommandFlags, CompletionCallback, ExtentCallback};
use crate::config::{HandleConfig, HandshakeFlags, StrictMode, TlsMode};
use crate::debug::DebugCallback;
use crate::engine::{Connection, ConnectionState, Direction, Phase};
use crate::error::{Error, Result};
use crate::meta::MetaContext;
use crate::negotiate::{BlockSizeKind, ExportEntry, ExportInfo, Goal, Outcome, Protocol};
use crate::protocol::*;
use crate::stats::Stats;
use crate::transport::{self, CommandTransport, TlsUpgrade, Transport};
use crate::uri::{NbdUri, UriTarget};

/// NBD strings are limited to 4096 bytes.
const NBD_MAX_STRING: usize = 4096;

/// Options for [`Handle::shutdown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownFlags {
    /// Disconnect without waiting for in-flight commands. Their replies are
    /// still processed if the server sends them before closing.
    pub abandon_pending: bool,
}

/// One NBD connection.
pub struct Handle {
    conn: Option<Box<Connection>>,
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl Handle {
    pub fn new() -> Self {
        Self {
            conn: Some(Box::new(Connection::new(&HandleConfig::default()))),
        }
    }

    pub fn from_config(config: &HandleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            conn: Some(Box::new(Connection::new(config))),
        })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_deref().ok_or(Error::HandleClosed)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn.as_deref_mut().ok_or(Error::HandleClosed)
    }

    /// Connection for a setter that is only meaningful before the handshake.
    fn before_connect(&mut self, operation: &'static str) -> Result<&mut Connection> {
        let conn = self.conn_mut()?;
        if conn.phase != Phase::Created {
            return Err(conn.invalid_state(operation));
        }
        Ok(conn)
    }

    /// Connection for a setter that still matters while negotiating.
    fn before_transmission(&mut self, operation: &'static str) -> Result<&mut Connection> {
        let conn = self.conn_mut()?;
        if !matches!(conn.phase, Phase::Created | Phase::Negotiating) {
            return Err(conn.invalid_state(operation));
        }
        Ok(conn)
    }

    /// Release the connection. Every later call, including another
    /// `close`, fails with [`Error::HandleClosed`].
    pub fn close(&mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(Error::HandleClosed)?;
        conn.debug.emit("close", format_args!("closing handle"));
        conn.close_transport();
        Ok(())
    }

    // Settings.

    pub fn set_export_name(&mut self, name: &str) -> Result<()> {
        if name.len() > NBD_MAX_STRING {
            return Err(Error::invalid_argument("export name exceeds 4096 bytes"));
        }
        let conn = self.before_transmission("set_export_name")?;
        if conn.settings.export_name != name {
            conn.settings.export_name = name.to_string();
            conn.export = None;
        }
        Ok(())
    }

    pub fn get_export_name(&self) -> Result<String> {
        Ok(self.conn()?.settings.export_name.clone())
    }

    pub fn set_tls(&mut self, mode: TlsMode) -> Result<()> {
        self.before_connect("set_tls")?.settings.tls = mode;
        Ok(())
    }

    pub fn get_tls(&self) -> Result<TlsMode> {
        Ok(self.conn()?.settings.tls)
    }

    /// Install the hook that performs the TLS handshake after STARTTLS.
    pub fn set_tls_upgrade(&mut self, upgrade: Box<dyn TlsUpgrade>) -> Result<()> {
        self.before_connect("set_tls_upgrade")?.tls_upgrade = Some(upgrade);
        Ok(())
    }

    pub fn set_handshake_flags(&mut self, flags: HandshakeFlags) -> Result<()> {
        self.before_connect("set_handshake_flags")?
            .settings
            .handshake_flags = flags;
        Ok(())
    }

    /// Flags in use: the configured ones before the greeting, afterwards the
    /// ones both sides agreed on.
    pub fn get_handshake_flags(&self) -> Result<HandshakeFlags> {
        let conn = self.conn()?;
        Ok(match conn.negotiated.protocol {
            Some(Protocol::Newstyle | Protocol::NewstyleFixed) => {
                HandshakeFlags::from_bits(conn.negotiated.client_flags)
            }
            _ => conn.settings.handshake_flags,
        })
    }

    pub fn set_request_structured_replies(&mut self, request: bool) -> Result<()> {
        self.before_connect("set_request_structured_replies")?
            .settings
            .request_structured_replies = request;
        Ok(())
    }

    pub fn get_request_structured_replies(&self) -> Result<bool> {
        Ok(self.conn()?.settings.request_structured_replies)
    }

    /// Whether GO and INFO renegotiate meta contexts. When off, the set
    /// negotiated by an earlier explicit `opt_set_meta_context` is kept.
    pub fn set_request_meta_context(&mut self, request: bool) -> Result<()> {
        self.before_transmission("set_request_meta_context")?
            .settings
            .request_meta_context = request;
        Ok(())
    }

    pub fn get_request_meta_context(&self) -> Result<bool> {
        Ok(self.conn()?.settings.request_meta_context)
    }

    /// Stop after the initial options and leave the handle idle in the
    /// negotiating state for explicit `opt_*` calls.
    pub fn set_opt_mode(&mut self, opt_mode: bool) -> Result<()> {
        self.before_connect("set_opt_mode")?.settings.opt_mode = opt_mode;
        Ok(())
    }

    pub fn get_opt_mode(&self) -> Result<bool> {
        Ok(self.conn()?.settings.opt_mode)
    }

    /// Also request the canonical name and description with INFO and GO.
    pub fn set_full_info(&mut self, full_info: bool) -> Result<()> {
        self.before_transmission("set_full_info")?.settings.full_info = full_info;
        Ok(())
    }

    pub fn get_full_info(&self) -> Result<bool> {
        Ok(self.conn()?.settings.full_info)
    }

    pub fn set_strict_mode(&mut self, strict: StrictMode) -> Result<()> {
        self.conn_mut()?.settings.strict = strict;
        Ok(())
    }

    pub fn get_strict_mode(&self) -> Result<StrictMode> {
        Ok(self.conn()?.settings.strict)
    }

    pub fn set_debug(&mut self, enabled: bool) -> Result<()> {
        self.conn_mut()?.debug.set_enabled(enabled);
        Ok(())
    }

    pub fn get_debug(&self) -> Result<bool> {
        Ok(self.conn()?.debug.is_enabled())
    }

    /// Route debug messages to `callback` instead of `tracing`. Passing
    /// `None` restores the default.
    pub fn set_debug_callback(&mut self, callback: Option<DebugCallback>) -> Result<()> {
        self.conn_mut()?.debug.set_callback(callback);
        Ok(())
    }

    // Meta contexts.

    pub fn add_meta_context(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > NBD_MAX_STRING {
            return Err(Error::invalid_argument(
                "meta context names must be 1 to 4096 bytes",
            ));
        }
        self.before_transmission("add_meta_context")?
            .meta
            .request(name);
        Ok(())
    }

    pub fn clear_meta_contexts(&mut self) -> Result<()> {
        self.before_transmission("clear_meta_contexts")?
            .meta
            .clear_requested();
        Ok(())
    }

    /// Number of requested contexts.
    pub fn get_nr_meta_contexts(&self) -> Result<usize> {
        Ok(self.conn()?.meta.requested().len())
    }

    pub fn get_meta_context(&self, index: usize) -> Result<String> {
        self.conn()?
            .meta
            .requested()
            .get(index)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("no meta context at index {index}")))
    }

    /// Whether the most recent negotiation granted `name`. Fails with
    /// [`Error::MetaContextsNotNegotiated`] when no negotiation has completed.
    pub fn can_meta_context(&self, name: &str) -> Result<bool> {
        self.conn()?.meta.can(name)
    }

    // Export information.

    fn export(&self) -> Result<&ExportInfo> {
        self.conn()?.export.as_ref().ok_or(Error::NoExportInfo)
    }

    fn export_flag(&self, flag: u16) -> Result<bool> {
        Ok(self.export()?.has_flag(flag))
    }

    pub fn get_size(&self) -> Result<u64> {
        Ok(self.export()?.size)
    }

    pub fn is_read_only(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_READ_ONLY)
    }

    pub fn can_flush(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_FLUSH)
    }

    pub fn can_fua(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_FUA)
    }

    pub fn can_trim(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_TRIM)
    }

    pub fn can_zero(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_WRITE_ZEROES)
    }

    pub fn can_fast_zero(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_FAST_ZERO)
    }

    pub fn can_cache(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_CACHE)
    }

    pub fn can_df(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_SEND_DF)
    }

    pub fn can_multi_conn(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_CAN_MULTI_CONN)
    }

    pub fn is_rotational(&self) -> Result<bool> {
        self.export_flag(NBD_FLAG_ROTATIONAL)
    }

    /// Block size constraint, or 0 when the server sent none.
    pub fn get_block_size(&self, kind: BlockSizeKind) -> Result<u32> {
        Ok(self.export()?.block_size.map_or(0, |b| b.get(kind)))
    }

    pub fn get_canonical_export_name(&self) -> Result<String> {
        self.export()?
            .canonical_name
            .clone()
            .ok_or(Error::NotSupported {
                feature: "NBD_INFO_NAME",
            })
    }

    pub fn get_export_description(&self) -> Result<String> {
        self.export()?
            .description
            .clone()
            .ok_or(Error::NotSupported {
                feature: "NBD_INFO_DESCRIPTION",
            })
    }

    pub fn get_protocol(&self) -> Result<Protocol> {
        let conn = self.conn()?;
        conn.negotiated
            .protocol
            .ok_or_else(|| conn.invalid_state("get_protocol"))
    }

    pub fn get_structured_replies_negotiated(&self) -> Result<bool> {
        Ok(self.conn()?.negotiated.structured_replies)
    }

    pub fn get_tls_negotiated(&self) -> Result<bool> {
        Ok(self.conn()?.negotiated.tls)
    }

    /// The URI the handle is connected to, with the current export name.
    pub fn get_uri(&self) -> Result<String> {
        let conn = self.conn()?;
        let mut uri = conn
            .uri
            .clone()
            .ok_or_else(|| Error::invalid_argument("connection has no URI form"))?;
        uri.export_name = conn.settings.export_name.clone();
        Ok(uri.to_string())
    }

    // Connecting.

    fn prepare_connect(&mut self, operation: &'static str) -> Result<&mut Connection> {
        let conn = self.before_connect(operation)?;
        if conn.settings.tls == TlsMode::Require && conn.tls_upgrade.is_none() {
            return Err(Error::Tls {
                reason: "TLS is required but no TLS upgrade is configured".into(),
            });
        }
        Ok(conn)
    }

    /// Start the handshake over an established transport without waiting.
    pub fn aio_connect_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.prepare_connect("connect")?.attach(transport)
    }

    pub fn aio_connect_tcp(&mut self, host: &str, port: u16) -> Result<()> {
        let conn = self.prepare_connect("connect_tcp")?;
        let stream = transport::tcp(host, port)?;
        conn.server_name = Some(host.to_string());
        conn.uri = Some(NbdUri {
            tls: conn.settings.tls == TlsMode::Require,
            target: UriTarget::Tcp {
                host: host.to_string(),
                port,
            },
            export_name: conn.settings.export_name.clone(),
        });
        conn.attach(Box::new(stream))
    }

    pub fn aio_connect_unix(&mut self, path: &Path) -> Result<()> {
        let conn = self.prepare_connect("connect_unix")?;
        let stream = transport::unix(path)?;
        conn.uri = Some(NbdUri {
            tls: conn.settings.tls == TlsMode::Require,
            target: UriTarget::Unix {
                socket: path.to_path_buf(),
            },
            export_name: conn.settings.export_name.clone(),
        });
        conn.attach(Box::new(stream))
    }

    /// Spawn `argv` with a socket as its stdin and stdout and speak NBD to it.
    pub fn aio_connect_command<S: AsRef<std::ffi::OsStr>>(&mut self, argv: &[S]) -> Result<()> {
        let conn = self.prepare_connect("connect_command")?;
        let child = CommandTransport::spawn(argv)?;
        conn.attach(Box::new(child))
    }

    /// Adopt a connected stream socket.
    pub fn aio_connect_socket(&mut self, fd: OwnedFd) -> Result<()> {
        let conn = self.prepare_connect("connect_socket")?;
        let stream = transport::socket(fd)?;
        conn.attach(Box::new(stream))
    }

    /// Connect to an `nbd://`, `nbds://`, `nbd+unix://` or `nbds+unix://`
    /// URI. The export name comes from the URI; the `s` schemes require TLS.
    pub fn aio_connect_uri(&mut self, uri: &str) -> Result<()> {
        let parsed = NbdUri::parse(uri)?;
        {
            let conn = self.before_connect("connect_uri")?;
            if parsed.tls {
                conn.settings.tls = TlsMode::Require;
            }
            conn.settings.export_name = parsed.export_name.clone();
        }
        let conn = self.prepare_connect("connect_uri")?;
        let transport: Box<dyn Transport> = match &parsed.target {
            UriTarget::Tcp { host, port } => {
                conn.server_name = Some(host.clone());
                Box::new(transport::tcp(host, *port)?)
            }
            UriTarget::Unix { socket } => Box::new(transport::unix(socket)?),
        };
        conn.debug
            .emit("connect_uri", format_args!("connecting to {parsed}"));
        conn.uri = Some(parsed);
        conn.attach(transport)
    }

    /// Run the handshake to the transmission phase, or to the idle
    /// negotiating state in option mode.
    fn finish_connect(&mut self) -> Result<()> {
        let conn = self.conn_mut()?;
        conn.run_until(|c| c.round.is_none())?;
        conn.outcome = None;
        match conn.phase {
            Phase::Ready | Phase::Negotiating => Ok(()),
            _ => Err(conn.invalid_state("connect")),
        }
    }

    pub fn connect_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.aio_connect_transport(transport)?;
        self.finish_connect()
    }

    pub fn connect_tcp(&mut self, host: &str, port: u16) -> Result<()> {
        self.aio_connect_tcp(host, port)?;
        self.finish_connect()
    }

    pub fn connect_unix(&mut self, path: &Path) -> Result<()> {
        self.aio_connect_unix(path)?;
        self.finish_connect()
    }

    pub fn connect_command<S: AsRef<std::ffi::OsStr>>(&mut self, argv: &[S]) -> Result<()> {
        self.aio_connect_command(argv)?;
        self.finish_connect()
    }

    pub fn connect_socket(&mut self, fd: OwnedFd) -> Result<()> {
        self.aio_connect_socket(fd)?;
        self.finish_connect()
    }

    pub fn connect_uri(&mut self, uri: &str) -> Result<()> {
        self.aio_connect_uri(uri)?;
        self.finish_connect()
    }

    // Option negotiation.

    fn ensure_idle(&mut self, operation: &'static str) -> Result<&mut Connection> {
        let conn = self.conn_mut()?;
        if conn.phase != Phase::Negotiating || conn.round.is_some() {
            return Err(conn.invalid_state(operation));
        }
        Ok(conn)
    }

    fn run_round(&mut self, goal: Goal, queries: Vec<String>) -> Result<Outcome> {
        let conn = self.conn_mut()?;
        conn.start_round(goal, queries)?;
        conn.run_until(|c| c.round.is_none())?;
        conn.take_outcome()
    }

    /// Select the export and enter the transmission phase.
    pub fn opt_go(&mut self) -> Result<()> {
        self.run_round(Goal::Go, Vec::new()).map(|_| ())
    }

    /// Fetch export information without leaving the negotiating state.
    pub fn opt_info(&mut self) -> Result<()> {
        self.run_round(Goal::Info, Vec::new()).map(|_| ())
    }

    /// End negotiation. The handle is closed afterwards.
    pub fn opt_abort(&mut self) -> Result<()> {
        self.run_round(Goal::Abort, Vec::new()).map(|_| ())
    }

    /// List exports, calling `callback` once per export in server order.
    /// Returns the number of exports.
    pub fn opt_list(&mut self, mut callback: impl FnMut(&ExportEntry)) -> Result<usize> {
        match self.run_round(Goal::List, Vec::new())? {
            Outcome::Exports(exports) => {
                exports.iter().for_each(&mut callback);
                Ok(exports.len())
            }
            other => Err(unexpected_outcome("opt_list", &other)),
        }
    }

    pub fn opt_list_exports(&mut self) -> Result<Vec<ExportEntry>> {
        let mut exports = Vec::new();
        self.opt_list(|e| exports.push(e.clone()))?;
        Ok(exports)
    }

    fn meta_round(
        &mut self,
        goal: Goal,
        operation: &'static str,
        queries: Option<Vec<String>>,
        callback: &mut dyn FnMut(&MetaContext),
    ) -> Result<usize> {
        let conn = self.ensure_idle(operation)?;
        if !conn.negotiated.structured_replies {
            return Err(Error::NotSupported {
                feature: "meta contexts without structured replies",
            });
        }
        let queries = queries.unwrap_or_else(|| conn.meta.requested().to_vec());
        match self.run_round(goal, queries)? {
            Outcome::Contexts(contexts) => {
                contexts.iter().for_each(callback);
                Ok(contexts.len())
            }
            other => Err(unexpected_outcome(operation, &other)),
        }
    }

    /// Ask which of the requested contexts the server supports, without
    /// selecting them.
    pub fn opt_list_meta_context(&mut self, mut callback: impl FnMut(&MetaContext)) -> Result<usize> {
        self.meta_round(Goal::ListMeta, "opt_list_meta_context", None, &mut callback)
    }

    /// Like [`Handle::opt_list_meta_context`] with a call-scoped query list.
    pub fn opt_list_meta_context_queries(
        &mut self,
        queries: &[&str],
        mut callback: impl FnMut(&MetaContext),
    ) -> Result<usize> {
        let queries = queries.iter().map(|q| q.to_string()).collect();
        self.meta_round(
            Goal::ListMeta,
            "opt_list_meta_context_queries",
            Some(queries),
            &mut callback,
        )
    }

    /// Select the requested contexts for the transmission phase.
    pub fn opt_set_meta_context(&mut self, mut callback: impl FnMut(&MetaContext)) -> Result<usize> {
        self.meta_round(Goal::SetMeta, "opt_set_meta_context", None, &mut callback)
    }

    pub fn opt_set_meta_context_queries(
        &mut self,
        queries: &[&str],
        mut callback: impl FnMut(&MetaContext),
    ) -> Result<usize> {
        let queries = queries.iter().map(|q| q.to_string()).collect();
        self.meta_round(
            Goal::SetMeta,
            "opt_set_meta_context_queries",
            Some(queries),
            &mut callback,
        )
    }

    /// Negotiate structured replies unless already done. Returns whether
    /// they are in effect.
    pub fn opt_structured_reply(&mut self) -> Result<bool> {
        if self.ensure_idle("opt_structured_reply")?
            .negotiated
            .structured_replies
        {
            return Ok(true);
        }
        match self.run_round(Goal::StructuredReply, Vec::new())? {
            Outcome::Flag(negotiated) => Ok(negotiated),
            other => Err(unexpected_outcome("opt_structured_reply", &other)),
        }
    }

    /// Upgrade to TLS. Returns whether TLS is in effect.
    pub fn opt_starttls(&mut self) -> Result<bool> {
        let conn = self.ensure_idle("opt_starttls")?;
        if conn.negotiated.tls {
            return Ok(true);
        }
        if conn.tls_upgrade.is_none() {
            return Err(Error::Tls {
                reason: "no TLS upgrade is configured".into(),
            });
        }
        match self.run_round(Goal::StartTls, Vec::new())? {
            Outcome::Flag(negotiated) => Ok(negotiated),
            other => Err(unexpected_outcome("opt_starttls", &other)),
        }
    }

    // Asynchronous commands.

    /// Read `buffer.len()` bytes at `offset` into `buffer`.
    pub fn aio_pread(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        let cmd = Command::new(NbdCommand::Read, offset, request_len(buffer.len())?, flags)
            .with_buffer(buffer.hold())
            .with_completion(completion);
        self.conn_mut()?.submit(cmd, None)
    }

    /// Read with a callback for every chunk as it arrives.
    pub fn aio_pread_structured(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        chunk: ChunkCallback,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        let cmd = Command::new(NbdCommand::Read, offset, request_len(buffer.len())?, flags)
            .with_buffer(buffer.hold())
            .with_chunk(Some(chunk))
            .with_completion(completion);
        self.conn_mut()?.submit(cmd, None)
    }

    /// Write the whole of `buffer` at `offset`. The buffer cannot be
    /// resized until the command is collected.
    pub fn aio_pwrite(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        let hold = buffer.hold();
        let payload = hold.snapshot();
        let cmd = Command::new(NbdCommand::Write, offset, request_len(payload.len())?, flags)
            .with_buffer(hold)
            .with_completion(completion);
        self.conn_mut()?.submit(cmd, Some(&payload))
    }

    pub fn aio_flush(
        &mut self,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        let cmd = Command::new(NbdCommand::Flush, 0, 0, flags).with_completion(completion);
        self.conn_mut()?.submit(cmd, None)
    }

    pub fn aio_trim(
        &mut self,
        count: u64,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        self.submit_range(NbdCommand::Trim, count, offset, completion, flags)
    }

    /// Ask the server to prefetch a range.
    pub fn aio_cache(
        &mut self,
        count: u64,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        self.submit_range(NbdCommand::Cache, count, offset, completion, flags)
    }

    pub fn aio_zero(
        &mut self,
        count: u64,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        self.submit_range(NbdCommand::WriteZeroes, count, offset, completion, flags)
    }

    /// Query block status. `extent` is called once per negotiated context
    /// the server reports on.
    pub fn aio_block_status(
        &mut self,
        count: u64,
        offset: u64,
        extent: ExtentCallback,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        let cmd = Command::new(NbdCommand::BlockStatus, offset, range_len(count)?, flags)
            .with_extent(Some(extent))
            .with_completion(completion);
        self.conn_mut()?.submit(cmd, None)
    }

    fn submit_range(
        &mut self,
        kind: NbdCommand,
        count: u64,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CommandFlags,
    ) -> Result<u64> {
        let cmd = Command::new(kind, offset, range_len(count)?, flags).with_completion(completion);
        self.conn_mut()?.submit(cmd, None)
    }

    /// `Ok(false)` while `cookie` is in flight. Once it has completed the
    /// command is retired and its result returned.
    pub fn aio_command_completed(&mut self, cookie: u64) -> Result<bool> {
        self.conn_mut()?.command_completed(cookie)
    }

    /// Lowest cookie that has completed but not been collected.
    pub fn aio_peek_command_completed(&self) -> Result<Option<u64>> {
        Ok(self.conn()?.peek_completed())
    }

    pub fn aio_in_flight(&self) -> Result<usize> {
        Ok(self.conn()?.in_flight())
    }

    /// Send the disconnect request without waiting for the server to close.
    pub fn aio_disconnect(&mut self) -> Result<()> {
        self.conn_mut()?.disconnect()
    }

    // Event loop integration.

    pub fn aio_get_direction(&self) -> Result<Direction> {
        Ok(self.conn()?.direction())
    }

    /// Descriptor to watch for the directions in
    /// [`Handle::aio_get_direction`].
    pub fn aio_get_fd(&self) -> Result<RawFd> {
        let conn = self.conn()?;
        conn.transport
            .as_ref()
            .map(|t| t.as_fd().as_raw_fd())
            .ok_or_else(|| conn.invalid_state("aio_get_fd"))
    }

    pub fn aio_notify_read(&mut self) -> Result<()> {
        self.conn_mut()?.notify_read()
    }

    pub fn aio_notify_write(&mut self) -> Result<()> {
        self.conn_mut()?.notify_write()
    }

    /// Wait up to `timeout_ms` milliseconds (-1 for no limit) and make
    /// progress. Returns whether any event was handled.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<bool> {
        self.conn_mut()?.poll(timeout_ms)
    }

    pub fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self.conn()?.state())
    }

    fn state_is(&self, state: ConnectionState) -> Result<bool> {
        Ok(self.conn()?.state() == state)
    }

    pub fn aio_is_created(&self) -> Result<bool> {
        self.state_is(ConnectionState::Created)
    }

    pub fn aio_is_connecting(&self) -> Result<bool> {
        self.state_is(ConnectionState::Connecting)
    }

    pub fn aio_is_negotiating(&self) -> Result<bool> {
        self.state_is(ConnectionState::Negotiating)
    }

    pub fn aio_is_ready(&self) -> Result<bool> {
        self.state_is(ConnectionState::Ready)
    }

    pub fn aio_is_processing(&self) -> Result<bool> {
        self.state_is(ConnectionState::Processing)
    }

    pub fn aio_is_dead(&self) -> Result<bool> {
        self.state_is(ConnectionState::Dead)
    }

    pub fn aio_is_closed(&self) -> Result<bool> {
        self.state_is(ConnectionState::Closed)
    }

    // Blocking commands.

    fn wait_for(&mut self, cookie: u64) -> Result<()> {
        let conn = self.conn_mut()?;
        conn.run_until(|c| c.command_done(cookie))?;
        conn.command_completed(cookie).map(|_| ())
    }

    pub fn pread(&mut self, buf: &mut [u8], offset: u64, flags: CommandFlags) -> Result<()> {
        let buffer = Buffer::new(buf.len());
        let cookie = self.aio_pread(&buffer, offset, None, flags)?;
        self.wait_for(cookie)?;
        buffer.read_at(0, buf)
    }

    pub fn pread_structured(
        &mut self,
        buf: &mut [u8],
        offset: u64,
        chunk: ChunkCallback,
        flags: CommandFlags,
    ) -> Result<()> {
        let buffer = Buffer::new(buf.len());
        let cookie = self.aio_pread_structured(&buffer, offset, chunk, None, flags)?;
        self.wait_for(cookie)?;
        buffer.read_at(0, buf)
    }

    pub fn pwrite(&mut self, buf: &[u8], offset: u64, flags: CommandFlags) -> Result<()> {
        let buffer = Buffer::from_slice(buf);
        let cookie = self.aio_pwrite(&buffer, offset, None, flags)?;
        self.wait_for(cookie)
    }

    pub fn flush(&mut self, flags: CommandFlags) -> Result<()> {
        let cookie = self.aio_flush(None, flags)?;
        self.wait_for(cookie)
    }

    pub fn trim(&mut self, count: u64, offset: u64, flags: CommandFlags) -> Result<()> {
        let cookie = self.aio_trim(count, offset, None, flags)?;
        self.wait_for(cookie)
    }

    pub fn cache(&mut self, count: u64, offset: u64, flags: CommandFlags) -> Result<()> {
        let cookie = self.aio_cache(count, offset, None, flags)?;
        self.wait_for(cookie)
    }

    pub fn zero(&mut self, count: u64, offset: u64, flags: CommandFlags) -> Result<()> {
        let cookie = self.aio_zero(count, offset, None, flags)?;
        self.wait_for(cookie)
    }

    pub fn block_status(
        &mut self,
        count: u64,
        offset: u64,
        extent: ExtentCallback,
        flags: CommandFlags,
    ) -> Result<()> {
        let cookie = self.aio_block_status(count, offset, extent, None, flags)?;
        self.wait_for(cookie)
    }

    /// Disconnect cleanly and wait for the server to close the connection.
    /// While negotiating this sends `NBD_OPT_ABORT` instead.
    pub fn shutdown(&mut self, flags: ShutdownFlags) -> Result<()> {
        let conn = self.conn_mut()?;
        match conn.phase {
            Phase::Negotiating if conn.round.is_none() => return self.opt_abort(),
            Phase::Ready => {}
            _ => return Err(conn.invalid_state("shutdown")),
        }
        if !flags.abandon_pending {
            conn.run_until(|c| c.in_flight() == 0)?;
        }
        conn.disconnect()?;
        conn.run_until(|c| matches!(c.phase, Phase::Closed | Phase::Dead))
    }

    // Statistics.

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.conn()?.stats)
    }

    pub fn get_bytes_sent(&self) -> Result<u64> {
        Ok(self.conn()?.stats.bytes_sent)
    }

    pub fn get_chunks_sent(&self) -> Result<u64> {
        Ok(self.conn()?.stats.chunks_sent)
    }

    pub fn get_bytes_received(&self) -> Result<u64> {
        Ok(self.conn()?.stats.bytes_received)
    }

    pub fn get_chunks_received(&self) -> Result<u64> {
        Ok(self.conn()?.stats.chunks_received)
    }
}

fn request_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::invalid_argument(format!("request length {len} too large")))
}

fn range_len(count: u64) -> Result<u32> {
    u32::try_from(count)
        .map_err(|_| Error::invalid_argument(format!("request length {count} too large")))
}

fn unexpected_outcome(operation: &str, outcome: &Outcome) -> Error {
    NbdError::unexpected(format!("{operation} finished with {outcome:?}")).into()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    /// Serve an oldstyle greeting for a 1 MiB export, then answer every
    /// request with a simple reply until the client disconnects.
    fn oldstyle_server(mut stream: UnixStream) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut greeting = Vec::new();
            greeting.extend_from_slice(&NBD_MAGIC.to_be_bytes());
            greeting.extend_from_slice(&NBD_OLDSTYLE_MAGIC.to_be_bytes());
            greeting.extend_from_slice(&(1u64 << 20).to_be_bytes());
            let flags = (NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH) as u32;
            greeting.extend_from_slice(&flags.to_be_bytes());
            greeting.extend_from_slice(&[0u8; NBD_ZERO_PAD_BYTES]);
            stream.write_all(&greeting).unwrap();

            loop {
                let mut header = [0u8; NbdRequest::SIZE_BYTES];
                if stream.read_exact(&mut header).is_err() {
                    return;
                }
                let request = NbdRequest::from_bytes(&header, 1 << 20).unwrap();
                match request.command {
                    NbdCommand::Disconnect => return,
                    NbdCommand::Read => {
                        stream
                            .write_all(&NbdReply::ok(request.cookie).to_bytes())
                            .unwrap();
                        stream
                            .write_all(&vec![0xab; request.length as usize])
                            .unwrap();
                    }
                    _ => stream
                        .write_all(&NbdReply::ok(request.cookie).to_bytes())
                        .unwrap(),
                }
            }
        })
    }

    fn connected() -> (Handle, thread::JoinHandle<()>) {
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        let server = oldstyle_server(server);
        let mut handle = Handle::new();
        handle.connect_transport(Box::new(client)).unwrap();
        (handle, server)
    }

    #[test]
    fn closed_handle_rejects_everything() {
        let mut handle = Handle::new();
        handle.close().unwrap();
        assert!(matches!(handle.close(), Err(Error::HandleClosed)));
        assert!(matches!(handle.stats(), Err(Error::HandleClosed)));
        assert!(matches!(handle.get_size(), Err(Error::HandleClosed)));
        assert!(matches!(handle.set_export_name("x"), Err(Error::HandleClosed)));
        assert!(matches!(handle.poll(0), Err(Error::HandleClosed)));
        assert!(matches!(
            handle.flush(CommandFlags::NONE),
            Err(Error::HandleClosed)
        ));
        assert!(matches!(handle.opt_go(), Err(Error::HandleClosed)));
        assert!(matches!(
            handle.can_meta_context(CONTEXT_BASE_ALLOCATION),
            Err(Error::HandleClosed)
        ));
    }

    #[test]
    fn fresh_handle_state() {
        let handle = Handle::new();
        assert!(handle.aio_is_created().unwrap());
        assert_eq!(handle.stats().unwrap(), Stats::default());
        assert_eq!(handle.aio_get_direction().unwrap(), Direction::None);
        assert!(matches!(handle.get_size(), Err(Error::NoExportInfo)));
        assert!(matches!(
            handle.can_meta_context(CONTEXT_BASE_ALLOCATION),
            Err(Error::MetaContextsNotNegotiated)
        ));
        assert!(handle.get_protocol().is_err());
        assert!(handle.get_uri().is_err());
    }

    #[test]
    fn meta_context_requests_are_sticky() {
        let mut handle = Handle::new();
        handle.add_meta_context(CONTEXT_BASE_ALLOCATION).unwrap();
        handle.add_meta_context("qemu:dirty-bitmap:a").unwrap();
        handle.add_meta_context(CONTEXT_BASE_ALLOCATION).unwrap();
        handle.set_export_name("other").unwrap();
        assert_eq!(handle.get_nr_meta_contexts().unwrap(), 2);
        assert_eq!(handle.get_meta_context(1).unwrap(), "qemu:dirty-bitmap:a");
        assert!(handle.get_meta_context(2).is_err());
        assert!(handle.add_meta_context("").is_err());

        handle.clear_meta_contexts().unwrap();
        assert_eq!(handle.get_nr_meta_contexts().unwrap(), 0);
    }

    #[test]
    fn required_tls_without_upgrade_fails_before_connecting() {
        let mut handle = Handle::new();
        handle.set_tls(TlsMode::Require).unwrap();
        let (client, _server) = UnixStream::pair().unwrap();
        let err = handle.connect_transport(Box::new(client)).unwrap_err();
        assert!(matches!(err, Error::Tls { .. }));
        assert!(handle.aio_is_created().unwrap());
    }

    #[test]
    fn rejects_overlong_export_name() {
        let mut handle = Handle::new();
        let name = "x".repeat(NBD_MAX_STRING + 1);
        assert!(matches!(
            handle.set_export_name(&name),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn from_config_validates() {
        let config = HandleConfig {
            request_structured_replies: false,
            meta_contexts: vec![CONTEXT_BASE_ALLOCATION.into()],
            ..Default::default()
        };
        assert!(matches!(Handle::from_config(&config), Err(Error::Config(_))));

        let config = HandleConfig {
            export_name: "disk".into(),
            opt_mode: true,
            ..Default::default()
        };
        let handle = Handle::from_config(&config).unwrap();
        assert_eq!(handle.get_export_name().unwrap(), "disk");
        assert!(handle.get_opt_mode().unwrap());
    }

    #[test]
    fn oldstyle_connection() {
        let (mut handle, server) = connected();
        assert_eq!(handle.get_protocol().unwrap(), Protocol::Oldstyle);
        assert_eq!(handle.get_size().unwrap(), 1 << 20);
        assert!(handle.can_flush().unwrap());
        assert!(!handle.can_trim().unwrap());
        assert!(!handle.get_structured_replies_negotiated().unwrap());
        assert!(!handle.can_meta_context(CONTEXT_BASE_ALLOCATION).unwrap());
        assert!(handle.aio_is_ready().unwrap());

        // Settings that shape the handshake are frozen now.
        assert!(matches!(
            handle.set_export_name("late"),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(handle.opt_go(), Err(Error::InvalidState { .. })));

        let mut buf = [0u8; 512];
        handle.pread(&mut buf, 4096, CommandFlags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 0xab));

        handle.flush(CommandFlags::NONE).unwrap();
        assert!(matches!(
            handle.trim(512, 0, CommandFlags::NONE),
            Err(Error::NotSupported { .. })
        ));
        assert!(matches!(
            handle.pread(&mut buf, (1 << 20) - 256, CommandFlags::NONE),
            Err(Error::OutOfBounds { .. })
        ));

        handle.shutdown(ShutdownFlags::default()).unwrap();
        assert!(handle.aio_is_closed().unwrap());
        assert!(handle.stats().unwrap().chunks_received >= 3);
        server.join().unwrap();

        handle.close().unwrap();
        assert!(matches!(handle.aio_is_closed(), Err(Error::HandleClosed)));
    }

    #[test]
    fn cookies_are_never_reused() {
        let (mut handle, server) = connected();
        let first = handle.aio_flush(None, CommandFlags::NONE).unwrap();
        let second = handle.aio_flush(None, CommandFlags::NONE).unwrap();
        assert!(second > first);
        while handle.aio_in_flight().unwrap() > 0 {
            handle.poll(-1).unwrap();
        }
        assert_eq!(handle.aio_peek_command_completed().unwrap(), Some(first));
        assert!(handle.aio_command_completed(first).unwrap());
        assert!(handle.aio_command_completed(second).unwrap());
        assert!(matches!(
            handle.aio_command_completed(first),
            Err(Error::UnknownCookie { .. })
        ));
        let third = handle.aio_flush(None, CommandFlags::NONE).unwrap();
        assert!(third > second);

        handle.shutdown(ShutdownFlags::default()).unwrap();
        server.join().unwrap();
    }
}
