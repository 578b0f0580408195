//! Simulated NBD server.
//!
//! `SimServer` handles a single connection: greeting, option negotiation
//! and transmission. It is transport-agnostic and works with any async
//! stream. Behavior the client must cope with (reordered replies, chunked
//! and sparse reads, missing options, spurious block status contexts) is
//! switched on through [`ServerConfig`].

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use nbd_client::NbdError;
use nbd_client::protocol::*;

use crate::backend::{Backend, BackendError};

/// Maximum length for option data during negotiation.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// How long a partly filled reply window waits for more requests.
const REPLY_WINDOW_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Oldstyle,
    /// Newstyle without `NBD_FLAG_FIXED_NEWSTYLE`: only EXPORT_NAME works.
    Newstyle,
    FixedNewstyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSpec {
    pub name: String,
    pub description: String,
}

impl ExportSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub greeting: Greeting,
    pub no_zeroes: bool,
    /// Every export is served from the same backend.
    pub exports: Vec<ExportSpec>,
    pub read_only: bool,
    /// Transmission flags to leave out of the advertisement.
    pub withheld_flags: u16,
    pub structured_replies: bool,
    pub meta_contexts: Vec<String>,
    /// Answer INFO and GO; when false they get `NBD_REP_ERR_UNSUP`.
    pub opt_go: bool,
    pub opt_list: bool,
    /// Acknowledge STARTTLS without encrypting anything.
    pub starttls: bool,
    /// Hold up to this many replies and send them in reverse order.
    pub reply_window: usize,
    /// Split structured read data into chunks of at most this size.
    pub read_chunk_bytes: Option<usize>,
    /// Send the chunks of a structured read in reverse offset order.
    pub reverse_chunks: bool,
    /// Send unallocated parts of structured reads as hole chunks.
    pub sparse_reads: bool,
    /// Add a block status chunk for a context id the client never asked for.
    pub spurious_context_id: Option<u32>,
    pub block_size: (u32, u32, u32),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            greeting: Greeting::FixedNewstyle,
            no_zeroes: true,
            exports: vec![ExportSpec::new("", "default export")],
            read_only: false,
            withheld_flags: 0,
            structured_replies: true,
            meta_contexts: vec![CONTEXT_BASE_ALLOCATION.to_string()],
            opt_go: true,
            opt_list: true,
            starttls: false,
            reply_window: 1,
            read_chunk_bytes: None,
            reverse_chunks: false,
            sparse_reads: false,
            spurious_context_id: None,
            block_size: (1, 4096, NBD_MAX_PAYLOAD_SIZE),
        }
    }
}

/// A request seen during transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedRequest {
    pub command: NbdCommand,
    pub flags: u16,
    pub offset: u64,
    pub length: u32,
}

/// Everything the client sent, for assertions in tests.
#[derive(Debug, Default)]
pub struct ServerLog {
    pub options: Vec<u32>,
    pub requests: Vec<LoggedRequest>,
}

/// Per-connection negotiation state.
#[derive(Debug, Default)]
struct Session {
    no_zeroes: bool,
    structured: bool,
    /// Contexts selected with SET_META_CONTEXT: `(id, name)`.
    contexts: Vec<(u32, String)>,
}

#[derive(Clone)]
pub struct SimServer {
    backend: Arc<dyn Backend>,
    size: u64,
    config: ServerConfig,
    log: Arc<Mutex<ServerLog>>,
}

impl SimServer {
    pub fn new(backend: Arc<dyn Backend>, size: u64, config: ServerConfig) -> Self {
        Self {
            backend,
            size,
            config,
            log: Arc::new(Mutex::new(ServerLog::default())),
        }
    }

    /// Shared log of the options and requests received.
    pub fn log(&self) -> Arc<Mutex<ServerLog>> {
        Arc::clone(&self.log)
    }

    fn transmission_flags(&self, session: &Session) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS
            | NBD_FLAG_SEND_FLUSH
            | NBD_FLAG_SEND_FUA
            | NBD_FLAG_SEND_TRIM
            | NBD_FLAG_SEND_WRITE_ZEROES
            | NBD_FLAG_SEND_CACHE
            | NBD_FLAG_SEND_FAST_ZERO
            | NBD_FLAG_CAN_MULTI_CONN;
        if session.structured {
            flags |= NBD_FLAG_SEND_DF;
        }
        if self.config.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags & !self.config.withheld_flags
    }

    fn find_export(&self, name: &str) -> Option<&ExportSpec> {
        self.config.exports.iter().find(|e| e.name == name)
    }

    /// Serve a single NBD connection. Returns when the client disconnects
    /// or an error occurs.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session::default();
        if self.config.greeting == Greeting::Oldstyle {
            self.oldstyle_greeting(&mut stream, &session).await?;
        } else {
            session.no_zeroes = self.handshake(&mut stream).await?;
            if !self.negotiate_options(&mut stream, &mut session).await? {
                return Ok(());
            }
        }
        self.transmission(&mut stream, &session).await
    }

    async fn oldstyle_greeting<S>(&self, stream: &mut S, session: &Session) -> Result<(), NbdError>
    where
        S: AsyncWrite + Unpin,
    {
        let mut hello = Vec::with_capacity(28 + NBD_ZERO_PAD_BYTES);
        hello.extend_from_slice(&NBD_MAGIC.to_be_bytes());
        hello.extend_from_slice(&NBD_OLDSTYLE_MAGIC.to_be_bytes());
        hello.extend_from_slice(&self.size.to_be_bytes());
        hello.extend_from_slice(&(self.transmission_flags(session) as u32).to_be_bytes());
        hello.resize(28 + NBD_ZERO_PAD_BYTES, 0);
        stream.write_all(&hello).await?;
        Ok(())
    }

    async fn handshake<S>(&self, stream: &mut S) -> Result<bool, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut hello = [0u8; 18];
        hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        let mut flags = 0;
        if self.config.greeting == Greeting::FixedNewstyle {
            flags |= NBD_FLAG_FIXED_NEWSTYLE;
        }
        if self.config.no_zeroes {
            flags |= NBD_FLAG_NO_ZEROES;
        }
        hello[16..18].copy_from_slice(&flags.to_be_bytes());
        stream.write_all(&hello).await?;

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        let client_flags = u32::from_be_bytes(buf);
        debug!(client_flags, "client flags");
        Ok(self.config.no_zeroes && client_flags & NBD_FLAG_C_NO_ZEROES != 0)
    }

    /// Returns false when the connection ends during negotiation.
    async fn negotiate_options<S>(&self, stream: &mut S, session: &mut Session) -> Result<bool, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut header = [0u8; OptionHeader::SIZE_BYTES];
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            let header = OptionHeader::from_bytes(&header)?;
            let option = header.option;
            let length = header.length as usize;

            // Bound allocation to prevent DoS from malicious clients
            if length > OPTION_DATA_MAX_BYTES {
                return Err(NbdError::RequestTooLarge {
                    length_bytes: length as u32,
                    max_bytes: OPTION_DATA_MAX_BYTES as u32,
                });
            }
            let mut data = vec![0u8; length];
            stream.read_exact(&mut data).await?;
            self.log.lock().options.push(option);
            debug!(option = option_name(option), length, "NBD option");

            if self.config.greeting == Greeting::Newstyle && option != NBD_OPT_EXPORT_NAME {
                warn!(option, "option requires fixed newstyle, closing");
                return Ok(false);
            }

            match option {
                NBD_OPT_EXPORT_NAME => {
                    let name = String::from_utf8_lossy(&data);
                    if self.find_export(&name).is_none() {
                        debug!(%name, "unknown export, closing");
                        return Ok(false);
                    }
                    let mut resp = Vec::with_capacity(10 + NBD_ZERO_PAD_BYTES);
                    resp.extend_from_slice(&self.size.to_be_bytes());
                    resp.extend_from_slice(&self.transmission_flags(session).to_be_bytes());
                    if !session.no_zeroes {
                        resp.resize(10 + NBD_ZERO_PAD_BYTES, 0);
                    }
                    stream.write_all(&resp).await?;
                    return Ok(true);
                }
                NBD_OPT_GO | NBD_OPT_INFO => {
                    if !self.config.opt_go {
                        send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                        continue;
                    }
                    let mut pos = 0;
                    let Some(name) = take_string(&data, &mut pos) else {
                        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    };
                    let requests = take_info_requests(&data, &mut pos);
                    let Some(export) = self.find_export(&name) else {
                        send_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"unknown export").await?;
                        continue;
                    };

                    let mut info = Vec::with_capacity(12);
                    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info.extend_from_slice(&self.size.to_be_bytes());
                    info.extend_from_slice(&self.transmission_flags(session).to_be_bytes());
                    send_reply(stream, option, NBD_REP_INFO, &info).await?;

                    let (minimum, preferred, maximum) = self.config.block_size;
                    let mut block = Vec::with_capacity(14);
                    block.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
                    for v in [minimum, preferred, maximum] {
                        block.extend_from_slice(&v.to_be_bytes());
                    }
                    send_reply(stream, option, NBD_REP_INFO, &block).await?;

                    if requests.contains(&NBD_INFO_NAME) {
                        let mut reply = NBD_INFO_NAME.to_be_bytes().to_vec();
                        reply.extend_from_slice(export.name.as_bytes());
                        send_reply(stream, option, NBD_REP_INFO, &reply).await?;
                    }
                    if requests.contains(&NBD_INFO_DESCRIPTION) && !export.description.is_empty() {
                        let mut reply = NBD_INFO_DESCRIPTION.to_be_bytes().to_vec();
                        reply.extend_from_slice(export.description.as_bytes());
                        send_reply(stream, option, NBD_REP_INFO, &reply).await?;
                    }

                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    if option == NBD_OPT_GO {
                        return Ok(true);
                    }
                }
                NBD_OPT_ABORT => {
                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Ok(false);
                }
                NBD_OPT_LIST => {
                    if !self.config.opt_list {
                        send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                        continue;
                    }
                    for export in &self.config.exports {
                        let name = export.name.as_bytes();
                        let mut entry = Vec::with_capacity(4 + name.len() + export.description.len());
                        entry.extend_from_slice(&(name.len() as u32).to_be_bytes());
                        entry.extend_from_slice(name);
                        entry.extend_from_slice(export.description.as_bytes());
                        send_reply(stream, option, NBD_REP_SERVER, &entry).await?;
                    }
                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }
                NBD_OPT_STRUCTURED_REPLY => {
                    if !self.config.structured_replies {
                        send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                    } else if !data.is_empty() {
                        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                    } else {
                        session.structured = true;
                        send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    }
                }
                NBD_OPT_STARTTLS => {
                    let reply = if self.config.starttls {
                        NBD_REP_ACK
                    } else {
                        NBD_REP_ERR_UNSUP
                    };
                    send_reply(stream, option, reply, &[]).await?;
                }
                NBD_OPT_LIST_META_CONTEXT | NBD_OPT_SET_META_CONTEXT => {
                    let set = option == NBD_OPT_SET_META_CONTEXT;
                    if !session.structured {
                        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    }
                    let Some(queries) = parse_meta_queries(&data) else {
                        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    };
                    let matches = self.match_contexts(&queries, set);
                    if set {
                        session.contexts = matches.clone();
                    }
                    for (id, name) in &matches {
                        let mut reply = id.to_be_bytes().to_vec();
                        reply.extend_from_slice(name.as_bytes());
                        send_reply(stream, option, NBD_REP_META_CONTEXT, &reply).await?;
                    }
                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }
                _ => {
                    send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                }
            }
        }
    }

    /// LIST with no queries returns every context, and a query ending in
    /// `:` matches every context with that namespace. SET takes exact
    /// names only.
    fn match_contexts(&self, queries: &[String], set: bool) -> Vec<(u32, String)> {
        self.config
            .meta_contexts
            .iter()
            .enumerate()
            .filter(|(_, name)| {
                if !set && queries.is_empty() {
                    return true;
                }
                queries.iter().any(|q| {
                    *name == q || (!set && q.ends_with(':') && name.starts_with(q.as_str()))
                })
            })
            .map(|(i, name)| (i as u32 + 1, name.clone()))
            .collect()
    }

    async fn transmission<S>(&self, stream: &mut S, session: &Session) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let window = self.config.reply_window.max(1);
        let mut pending: Vec<Vec<u8>> = Vec::new();

        loop {
            let mut header = [0u8; NbdRequest::SIZE_BYTES];
            let mut filled = 0;
            while filled < header.len() {
                let read = stream.read(&mut header[filled..]);
                let n = if pending.is_empty() {
                    read.await?
                } else {
                    match tokio::time::timeout(REPLY_WINDOW_DELAY, read).await {
                        Ok(n) => n?,
                        Err(_) => {
                            flush_replies(stream, &mut pending).await?;
                            continue;
                        }
                    }
                };
                if n == 0 {
                    flush_replies(stream, &mut pending).await?;
                    if filled == 0 {
                        return Ok(());
                    }
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                filled += n;
            }

            let req = match NbdRequest::from_bytes(&header, self.size) {
                Ok(req) => req,
                Err(NbdError::RequestTooLarge { .. }) => {
                    // Parse just the cookie to send an error reply
                    let cookie = be64_at(&header, 8);
                    stream
                        .write_all(&NbdReply::error(cookie, NBD_EOVERFLOW).to_bytes())
                        .await?;
                    continue;
                }
                Err(NbdError::UnsupportedCommand { command }) => {
                    warn!(command, "unsupported command");
                    let cookie = be64_at(&header, 8);
                    stream
                        .write_all(&NbdReply::error(cookie, NBD_EINVAL).to_bytes())
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.log.lock().requests.push(LoggedRequest {
                command: req.command,
                flags: req.flags,
                offset: req.offset,
                length: req.length,
            });

            let reply = match req.command {
                NbdCommand::Disconnect => {
                    flush_replies(stream, &mut pending).await?;
                    debug!("client disconnected");
                    return Ok(());
                }
                NbdCommand::Write => {
                    let mut data = BytesMut::zeroed(req.length as usize);
                    stream.read_exact(&mut data).await?;
                    if self.config.read_only {
                        simple(req.cookie, NBD_EPERM)
                    } else {
                        let result = self.backend.write(req.offset, data.freeze()).await;
                        simple_result(req.cookie, "write", result)
                    }
                }
                NbdCommand::Read => self.read_reply(&req, session).await,
                NbdCommand::Flush => simple_result(req.cookie, "flush", self.backend.flush().await),
                NbdCommand::Trim | NbdCommand::WriteZeroes if self.config.read_only => {
                    simple(req.cookie, NBD_EPERM)
                }
                NbdCommand::Trim => {
                    let result = self.backend.trim(req.offset, req.length as u64).await;
                    simple_result(req.cookie, "trim", result)
                }
                NbdCommand::WriteZeroes => {
                    let result = self
                        .backend
                        .write_zeroes(req.offset, req.length as u64)
                        .await;
                    simple_result(req.cookie, "write_zeroes", result)
                }
                NbdCommand::Cache => {
                    let result = self.backend.cache(req.offset, req.length as u64).await;
                    simple_result(req.cookie, "cache", result)
                }
                NbdCommand::BlockStatus => self.block_status_reply(&req, session).await,
            };

            if window == 1 {
                stream.write_all(&reply).await?;
            } else {
                pending.push(reply);
                if pending.len() >= window {
                    flush_replies(stream, &mut pending).await?;
                }
            }
        }
    }

    async fn read_reply(&self, req: &NbdRequest, session: &Session) -> Vec<u8> {
        let length = req.length as u64;
        if !session.structured {
            return match self.backend.read(req.offset, req.length as usize).await {
                Ok(data) => {
                    let mut reply = NbdReply::ok(req.cookie).to_bytes().to_vec();
                    reply.extend_from_slice(&data);
                    reply
                }
                Err(e) => {
                    warn!(error = %e, "read error");
                    simple(req.cookie, e.errno)
                }
            };
        }

        let df = req.flags & NBD_CMD_FLAG_DF != 0;
        // (offset, length, is_hole)
        let mut segments = Vec::new();
        if self.config.sparse_reads && !df {
            let runs = self
                .backend
                .extents(CONTEXT_BASE_ALLOCATION, req.offset, length)
                .await
                .unwrap_or_else(|_| vec![(req.length, 0)]);
            let mut pos = req.offset;
            let end = req.offset + length;
            for (run, status) in runs {
                if pos >= end {
                    break;
                }
                let len = (run as u64).min(end - pos);
                segments.push((pos, len, status & NBD_STATE_HOLE != 0));
                pos += len;
            }
        } else {
            segments.push((req.offset, length, false));
        }

        let mut chunks: Vec<(u16, Vec<u8>)> = Vec::new();
        for (offset, len, hole) in segments {
            if hole {
                let mut payload = offset.to_be_bytes().to_vec();
                payload.extend_from_slice(&(len as u32).to_be_bytes());
                chunks.push((NBD_REPLY_TYPE_OFFSET_HOLE, payload));
                continue;
            }
            let data = match self.backend.read(offset, len as usize).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "read error");
                    return structured_error(req.cookie, offset, &e);
                }
            };
            let step = match self.config.read_chunk_bytes {
                Some(n) if !df && n > 0 => n,
                _ => data.len().max(1),
            };
            for (i, piece) in data.chunks(step).enumerate() {
                let mut payload = (offset + (i * step) as u64).to_be_bytes().to_vec();
                payload.extend_from_slice(piece);
                chunks.push((NBD_REPLY_TYPE_OFFSET_DATA, payload));
            }
        }
        if self.config.reverse_chunks {
            chunks.reverse();
        }

        let mut reply = Vec::new();
        if chunks.is_empty() {
            push_chunk(&mut reply, req.cookie, NBD_REPLY_TYPE_NONE, true, &[]);
        }
        let last = chunks.len().saturating_sub(1);
        for (i, (reply_type, payload)) in chunks.iter().enumerate() {
            push_chunk(&mut reply, req.cookie, *reply_type, i == last, payload);
        }
        reply
    }

    async fn block_status_reply(&self, req: &NbdRequest, session: &Session) -> Vec<u8> {
        if !session.structured || session.contexts.is_empty() {
            return simple(req.cookie, NBD_EINVAL);
        }
        let length = req.length as u64;
        let end = req.offset + length;
        let mut reply = Vec::new();
        for (id, name) in &session.contexts {
            let runs = match self.backend.extents(name, req.offset, length).await {
                Ok(runs) => runs,
                Err(e) => return structured_error(req.cookie, req.offset, &e),
            };
            let mut payload = id.to_be_bytes().to_vec();
            let mut pos = req.offset;
            for (run, status) in runs {
                if pos >= end {
                    break;
                }
                let len = (run as u64).min(end - pos);
                payload.extend_from_slice(&(len as u32).to_be_bytes());
                payload.extend_from_slice(&status.to_be_bytes());
                pos += len;
                if req.flags & NBD_CMD_FLAG_REQ_ONE != 0 {
                    break;
                }
            }
            push_chunk(&mut reply, req.cookie, NBD_REPLY_TYPE_BLOCK_STATUS, false, &payload);
        }
        if let Some(id) = self.config.spurious_context_id {
            let mut payload = id.to_be_bytes().to_vec();
            payload.extend_from_slice(&req.length.to_be_bytes());
            payload.extend_from_slice(&0u32.to_be_bytes());
            push_chunk(&mut reply, req.cookie, NBD_REPLY_TYPE_BLOCK_STATUS, false, &payload);
        }
        push_chunk(&mut reply, req.cookie, NBD_REPLY_TYPE_NONE, true, &[]);
        reply
    }
}

async fn send_reply<S>(stream: &mut S, option: u32, reply: u32, data: &[u8]) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let header = OptionReplyHeader {
        option,
        reply,
        length: data.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

/// Write held replies, newest first.
async fn flush_replies<S>(stream: &mut S, pending: &mut Vec<Vec<u8>>) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    while let Some(reply) = pending.pop() {
        stream.write_all(&reply).await?;
    }
    Ok(())
}

fn simple(cookie: u64, error: u32) -> Vec<u8> {
    NbdReply::error(cookie, error).to_bytes().to_vec()
}

fn simple_result(cookie: u64, operation: &str, result: Result<(), BackendError>) -> Vec<u8> {
    match result {
        Ok(()) => simple(cookie, NBD_OK),
        Err(e) => {
            warn!(error = %e, operation, "request failed");
            simple(cookie, e.errno)
        }
    }
}

fn push_chunk(out: &mut Vec<u8>, cookie: u64, reply_type: u16, done: bool, payload: &[u8]) {
    let header = StructuredReplyHeader {
        flags: if done { NBD_REPLY_FLAG_DONE } else { 0 },
        reply_type,
        cookie,
        length: payload.len() as u32,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
}

fn structured_error(cookie: u64, offset: u64, error: &BackendError) -> Vec<u8> {
    let message = error.message.as_bytes();
    let mut payload = error.errno.to_be_bytes().to_vec();
    payload.extend_from_slice(&(message.len() as u16).to_be_bytes());
    payload.extend_from_slice(message);
    payload.extend_from_slice(&offset.to_be_bytes());
    let mut reply = Vec::new();
    push_chunk(&mut reply, cookie, NBD_REPLY_TYPE_ERROR_OFFSET, true, &payload);
    reply
}

fn be64_at(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn take_u32(data: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = data.get(*pos..*pos + 4)?;
    *pos += 4;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_string(data: &[u8], pos: &mut usize) -> Option<String> {
    let len = take_u32(data, pos)? as usize;
    let bytes = data.get(*pos..*pos + len)?;
    *pos += len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn take_info_requests(data: &[u8], pos: &mut usize) -> Vec<u16> {
    let Some(count) = data.get(*pos..*pos + 2) else {
        return Vec::new();
    };
    let count = u16::from_be_bytes([count[0], count[1]]) as usize;
    (0..count)
        .filter_map(|i| {
            let at = *pos + 2 + 2 * i;
            data.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
        })
        .collect()
}

/// Export name followed by the query list.
fn parse_meta_queries(data: &[u8]) -> Option<Vec<String>> {
    let mut pos = 0;
    take_string(data, &mut pos)?;
    let count = take_u32(data, &mut pos)?;
    (0..count).map(|_| take_string(data, &mut pos)).collect()
}

/// The server side of a [`spawn_server`] connection.
pub struct ServerThread {
    thread: thread::JoinHandle<Result<(), NbdError>>,
}

impl ServerThread {
    /// Wait for the connection to end and return how it ended.
    pub fn join(self) -> Result<(), NbdError> {
        self.thread
            .join()
            .unwrap_or(Err(NbdError::NegotiationFailed {
                reason: "server thread panicked",
            }))
    }
}

/// Run `server` on its own thread and return the client end of the
/// connection, already in non-blocking mode.
pub fn spawn_server(server: SimServer) -> io::Result<(UnixStream, ServerThread)> {
    let (client, server_end) = UnixStream::pair()?;
    client.set_nonblocking(true)?;
    server_end.set_nonblocking(true)?;
    let thread = thread::Builder::new()
        .name("nbd-sim-server".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let stream = tokio::net::UnixStream::from_std(server_end)?;
                let result = server.serve(stream).await;
                if let Err(e) = &result {
                    debug!(error = %e, "server connection ended with error");
                }
                result
            })
        })?;
    Ok((client, ServerThread { thread }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn server(config: ServerConfig) -> SimServer {
        SimServer::new(Arc::new(MemoryBackend::new(1 << 20)), 1 << 20, config)
    }

    #[test]
    fn meta_context_matching() {
        let server = server(ServerConfig {
            meta_contexts: vec![
                CONTEXT_BASE_ALLOCATION.to_string(),
                "qemu:dirty-bitmap:a".to_string(),
                "qemu:dirty-bitmap:b".to_string(),
            ],
            ..Default::default()
        });
        assert_eq!(server.match_contexts(&[], false).len(), 3);
        assert!(server.match_contexts(&[], true).is_empty());

        let prefix = vec!["qemu:".to_string()];
        let listed = server.match_contexts(&prefix, false);
        assert_eq!(
            listed,
            vec![
                (2, "qemu:dirty-bitmap:a".to_string()),
                (3, "qemu:dirty-bitmap:b".to_string())
            ]
        );
        assert!(server.match_contexts(&prefix, true).is_empty());

        let exact = vec![CONTEXT_BASE_ALLOCATION.to_string(), "x-unknown".to_string()];
        assert_eq!(
            server.match_contexts(&exact, true),
            vec![(1, CONTEXT_BASE_ALLOCATION.to_string())]
        );
    }

    #[test]
    fn option_data_parsing() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"disk");
        data.extend_from_slice(&2u32.to_be_bytes());
        for q in ["base:allocation", "qemu:"] {
            data.extend_from_slice(&(q.len() as u32).to_be_bytes());
            data.extend_from_slice(q.as_bytes());
        }
        assert_eq!(
            parse_meta_queries(&data).unwrap(),
            vec!["base:allocation".to_string(), "qemu:".to_string()]
        );
        assert!(parse_meta_queries(&data[..data.len() - 1]).is_none());

        let mut info = 0u32.to_be_bytes().to_vec();
        info.extend_from_slice(&2u16.to_be_bytes());
        info.extend_from_slice(&NBD_INFO_NAME.to_be_bytes());
        info.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
        let mut pos = 0;
        assert_eq!(take_string(&info, &mut pos).unwrap(), "");
        assert_eq!(
            take_info_requests(&info, &mut pos),
            vec![NBD_INFO_NAME, NBD_INFO_BLOCK_SIZE]
        );
    }

    #[test]
    fn withheld_flags_are_not_advertised() {
        let server = server(ServerConfig {
            withheld_flags: NBD_FLAG_SEND_TRIM,
            read_only: true,
            ..Default::default()
        });
        let session = Session {
            structured: true,
            ..Default::default()
        };
        let flags = server.transmission_flags(&session);
        assert_eq!(flags & NBD_FLAG_SEND_TRIM, 0);
        assert_ne!(flags & NBD_FLAG_READ_ONLY, 0);
        assert_ne!(flags & NBD_FLAG_SEND_DF, 0);
    }

    #[tokio::test]
    async fn block_status_clips_to_request() {
        let backend = MemoryBackend::new(65536).with_layout(vec![(32768, 3), (32768, 0)]);
        let server = SimServer::new(Arc::new(backend), 65536, ServerConfig::default());
        let session = Session {
            structured: true,
            contexts: vec![(1, CONTEXT_BASE_ALLOCATION.to_string())],
            ..Default::default()
        };
        let req = NbdRequest {
            flags: 0,
            command: NbdCommand::BlockStatus,
            cookie: 9,
            offset: 30000,
            length: 4096,
        };
        let reply = server.block_status_reply(&req, &session).await;
        // id, then two extents, then the final NONE chunk.
        let header = StructuredReplyHeader::SIZE_BYTES;
        assert_eq!(reply.len(), header + 4 + 16 + header);
        let extents = &reply[header + 4..header + 20];
        assert_eq!(&extents[0..4], &2768u32.to_be_bytes());
        assert_eq!(&extents[8..12], &1328u32.to_be_bytes());
    }
}
