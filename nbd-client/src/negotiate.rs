//! Handshake and option negotiation.
//!
//! Every exchange before the transmission phase runs as a [`Round`]: a goal
//! (the connect handshake, or one explicit `opt_*` request) advanced one
//! option at a time. Each reply either completes the current step, moves
//! to the next step, or finishes the round with an [`Outcome`].

use bytes::Buf;

use crate::config::TlsMode;
use crate::engine::{Connection, Phase};
use crate::error::{Error, Result};
use crate::meta::{self, MetaContext};
use crate::protocol::*;

/// Handshake style the server offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Oldstyle,
    Newstyle,
    NewstyleFixed,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Oldstyle => "oldstyle",
            Protocol::Newstyle => "newstyle",
            Protocol::NewstyleFixed => "newstyle-fixed",
        }
    }
}

/// Block size constraints advertised with `NBD_INFO_BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    pub minimum: u32,
    pub preferred: u32,
    pub maximum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizeKind {
    Minimum,
    Preferred,
    Maximum,
}

impl BlockSize {
    pub fn get(&self, kind: BlockSizeKind) -> u32 {
        match kind {
            BlockSizeKind::Minimum => self.minimum,
            BlockSizeKind::Preferred => self.preferred,
            BlockSizeKind::Maximum => self.maximum,
        }
    }
}

/// Metadata for the selected export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportInfo {
    pub size: u64,
    /// Transmission flags (`NBD_FLAG_*`).
    pub flags: u16,
    pub block_size: Option<BlockSize>,
    pub canonical_name: Option<String>,
    pub description: Option<String>,
}

impl ExportInfo {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.has_flag(NBD_FLAG_READ_ONLY)
    }
}

/// One export from `NBD_OPT_LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Goal {
    Handshake,
    Go,
    Info,
    List,
    ListMeta,
    SetMeta,
    StructuredReply,
    StartTls,
    Abort,
}

/// The exchange currently awaiting a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Greeting,
    StartTls,
    StructuredReply,
    SetMeta,
    ListMeta,
    Info,
    Go,
    ExportName,
    List,
    Abort,
}

impl Step {
    fn option(self) -> u32 {
        match self {
            Step::Greeting => 0,
            Step::StartTls => NBD_OPT_STARTTLS,
            Step::StructuredReply => NBD_OPT_STRUCTURED_REPLY,
            Step::SetMeta => NBD_OPT_SET_META_CONTEXT,
            Step::ListMeta => NBD_OPT_LIST_META_CONTEXT,
            Step::Info => NBD_OPT_INFO,
            Step::Go => NBD_OPT_GO,
            Step::ExportName => NBD_OPT_EXPORT_NAME,
            Step::List => NBD_OPT_LIST,
            Step::Abort => NBD_OPT_ABORT,
        }
    }
}

/// Position in the connect sequence, named after the part just finished.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Greeted,
    Tls,
    Structured,
    /// Ready to select the export (INFO or GO), after an optional SET.
    Export,
    Meta,
}

pub(crate) struct Round {
    pub goal: Goal,
    pub step: Step,
    queries: Vec<String>,
    contexts: Vec<MetaContext>,
    exports: Vec<ExportEntry>,
    info: ExportInfo,
    have_export: bool,
}

impl Round {
    pub(crate) fn handshake() -> Self {
        Self::new(Goal::Handshake, Vec::new())
    }

    pub(crate) fn new(goal: Goal, queries: Vec<String>) -> Self {
        Self {
            goal,
            step: Step::Greeting,
            queries,
            contexts: Vec::new(),
            exports: Vec::new(),
            info: ExportInfo::default(),
            have_export: false,
        }
    }
}

/// Result of a finished round.
#[derive(Debug)]
pub(crate) enum Outcome {
    Done,
    Flag(bool),
    Exports(Vec<ExportEntry>),
    Contexts(Vec<MetaContext>),
}

impl Connection {
    fn goal(&self) -> Goal {
        self.round.as_ref().map_or(Goal::Handshake, |r| r.goal)
    }

    fn round_mut(&mut self) -> Result<&mut Round> {
        self.round
            .as_mut()
            .ok_or_else(|| NbdError::unexpected("option reply with no exchange in progress").into())
    }

    /// Begin an explicit option exchange from the idle negotiating state.
    pub(crate) fn start_round(&mut self, goal: Goal, queries: Vec<String>) -> Result<()> {
        let operation = goal_name(goal);
        if self.phase != Phase::Negotiating || self.round.is_some() {
            return Err(self.invalid_state(operation));
        }
        if self.negotiated.protocol != Some(Protocol::NewstyleFixed) {
            return Err(Error::NotSupported {
                feature: "option negotiation without the fixed newstyle handshake",
            });
        }
        self.outcome = None;
        self.round = Some(Round::new(goal, queries));
        self.debug
            .emit(operation, format_args!("starting {operation}"));
        match goal {
            Goal::Go | Goal::Info => self.advance(Stage::Export)?,
            Goal::List => self.send_step(Step::List)?,
            Goal::ListMeta => self.send_step(Step::ListMeta)?,
            Goal::SetMeta => {
                self.meta.begin_negotiation();
                self.send_step(Step::SetMeta)?;
            }
            Goal::StructuredReply => self.send_step(Step::StructuredReply)?,
            Goal::StartTls => self.send_step(Step::StartTls)?,
            Goal::Abort => self.send_step(Step::Abort)?,
            Goal::Handshake => return Err(self.invalid_state(operation)),
        }
        self.notify_write()
    }

    /// Take the outcome of the round that just finished.
    pub(crate) fn take_outcome(&mut self) -> Result<Outcome> {
        self.outcome
            .take()
            .unwrap_or_else(|| Err(NbdError::ConnectionClosed.into()))
    }

    fn finish_round(&mut self, outcome: Result<Outcome>) {
        if let Some(round) = self.round.take() {
            match &outcome {
                Ok(_) => self
                    .debug
                    .emit(goal_name(round.goal), format_args!("finished")),
                Err(e) => self
                    .debug
                    .emit(goal_name(round.goal), format_args!("failed: {e}")),
            }
        }
        self.outcome = Some(outcome);
    }

    fn wants_tls(&self) -> Result<bool> {
        match self.settings.tls {
            TlsMode::Disable => Ok(false),
            TlsMode::Allow => Ok(self.tls_upgrade.is_some()),
            TlsMode::Require if self.tls_upgrade.is_some() => Ok(true),
            TlsMode::Require => Err(Error::Tls {
                reason: "TLS is required but no TLS upgrade is configured".into(),
            }),
        }
    }

    /// Choose and send the next option of the connect sequence (or of an
    /// explicit INFO/GO exchange, which enters at [`Stage::Export`]).
    fn advance(&mut self, mut stage: Stage) -> Result<()> {
        loop {
            stage = match stage {
                Stage::Greeted => {
                    if self.negotiated.protocol == Some(Protocol::Newstyle) {
                        return self.send_step(Step::ExportName);
                    }
                    if self.wants_tls()? {
                        return self.send_step(Step::StartTls);
                    }
                    Stage::Tls
                }
                Stage::Tls => {
                    if self.settings.request_structured_replies {
                        return self.send_step(Step::StructuredReply);
                    }
                    Stage::Structured
                }
                Stage::Structured => {
                    if self.settings.opt_mode {
                        self.finish_round(Ok(Outcome::Done));
                        return Ok(());
                    }
                    Stage::Export
                }
                Stage::Export => {
                    if self.settings.request_meta_context {
                        self.meta.begin_negotiation();
                        if self.negotiated.structured_replies && !self.meta.requested().is_empty()
                        {
                            let queries = self.meta.requested().to_vec();
                            self.round_mut()?.queries = queries;
                            return self.send_step(Step::SetMeta);
                        }
                    }
                    Stage::Meta
                }
                Stage::Meta => {
                    self.export = None;
                    let step = if self.goal() == Goal::Info {
                        Step::Info
                    } else {
                        Step::Go
                    };
                    return self.send_step(step);
                }
            };
        }
    }

    fn send_step(&mut self, step: Step) -> Result<()> {
        let data = match step {
            Step::SetMeta | Step::ListMeta => {
                let queries = self.round.as_ref().map_or(&[][..], |r| &r.queries[..]);
                meta::encode_queries(&self.settings.export_name, queries)
            }
            Step::Info | Step::Go => {
                encode_info_request(&self.settings.export_name, self.settings.full_info)
            }
            Step::ExportName => self.settings.export_name.as_bytes().to_vec(),
            Step::StartTls | Step::StructuredReply | Step::List | Step::Abort => Vec::new(),
            Step::Greeting => return Err(NbdError::unexpected("greeting is not an option").into()),
        };
        let round = self.round_mut()?;
        round.step = step;
        round.contexts.clear();
        round.exports.clear();
        round.info = ExportInfo::default();
        round.have_export = false;

        let header = OptionHeader {
            option: step.option(),
            length: data.len() as u32,
        };
        self.queue_frame(&header.to_bytes(), &data);
        self.debug.emit(
            "negotiate",
            format_args!("sending {}", option_name(step.option())),
        );
        Ok(())
    }

    /// Parse the server greeting. Returns false until it is complete.
    pub(crate) fn parse_greeting(&mut self) -> Result<bool> {
        const NEWSTYLE_BYTES: usize = 18;
        const OLDSTYLE_BYTES: usize = 16 + 8 + 4 + NBD_ZERO_PAD_BYTES;

        if self.rbuf.len() < 16 {
            return Ok(false);
        }
        let magic = be64(&self.rbuf[0..8]);
        if magic != NBD_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_MAGIC,
                actual: magic,
            }
            .into());
        }

        match be64(&self.rbuf[8..16]) {
            NBD_OPTS_MAGIC => {
                if self.rbuf.len() < NEWSTYLE_BYTES {
                    return Ok(false);
                }
                let greeting = self.rbuf.split_to(NEWSTYLE_BYTES);
                self.stats.record_received_chunk();
                let server_flags = be16(&greeting[16..18]);
                let wanted = self.settings.handshake_flags;

                let mut client_flags = 0;
                if server_flags & NBD_FLAG_FIXED_NEWSTYLE != 0 && wanted.fixed_newstyle {
                    client_flags |= NBD_FLAG_C_FIXED_NEWSTYLE;
                }
                if server_flags & NBD_FLAG_NO_ZEROES != 0 && wanted.no_zeroes {
                    client_flags |= NBD_FLAG_C_NO_ZEROES;
                }
                let protocol = if client_flags & NBD_FLAG_C_FIXED_NEWSTYLE != 0 {
                    Protocol::NewstyleFixed
                } else {
                    Protocol::Newstyle
                };
                self.negotiated.server_flags = server_flags;
                self.negotiated.client_flags = client_flags;
                self.negotiated.protocol = Some(protocol);
                self.debug.emit(
                    "connect",
                    format_args!(
                        "{} handshake, server flags {server_flags:#x}, client flags {client_flags:#x}",
                        protocol.as_str()
                    ),
                );

                self.queue_frame(&client_flags.to_be_bytes(), &[]);
                self.phase = Phase::Negotiating;
                self.advance(Stage::Greeted)?;
            }
            NBD_OLDSTYLE_MAGIC => {
                if self.rbuf.len() < OLDSTYLE_BYTES {
                    return Ok(false);
                }
                let greeting = self.rbuf.split_to(OLDSTYLE_BYTES);
                self.stats.record_received_chunk();
                let size = be64(&greeting[16..24]);
                let flags = (be32(&greeting[24..28]) & 0xffff) as u16;
                self.negotiated.protocol = Some(Protocol::Oldstyle);
                self.debug.emit(
                    "connect",
                    format_args!("oldstyle handshake, size {size}, flags {flags:#x}"),
                );
                self.export = Some(ExportInfo {
                    size,
                    flags,
                    ..ExportInfo::default()
                });
                self.enter_transmission();
                self.finish_round(Ok(Outcome::Done));
            }
            other => {
                return Err(NbdError::InvalidMagic {
                    expected: NBD_OPTS_MAGIC,
                    actual: other,
                }
                .into());
            }
        }
        Ok(true)
    }

    fn enter_transmission(&mut self) {
        self.phase = Phase::Ready;
        if self.settings.request_meta_context
            || self.negotiated.protocol != Some(Protocol::NewstyleFixed)
        {
            self.meta.settle_for_transmission();
        }
        if let Some(export) = &self.export {
            self.debug.emit(
                "connect",
                format_args!(
                    "transmission phase, size {} flags {:#x}",
                    export.size, export.flags
                ),
            );
        }
    }

    /// Parse one option reply. Returns false until a full frame is buffered.
    pub(crate) fn parse_option_reply(&mut self) -> Result<bool> {
        let Some(step) = self.round.as_ref().map(|r| r.step) else {
            return Ok(false);
        };
        if step == Step::ExportName {
            return self.parse_export_name_reply();
        }
        if self.rbuf.len() < OptionReplyHeader::SIZE_BYTES {
            return Ok(false);
        }
        let mut head = [0u8; OptionReplyHeader::SIZE_BYTES];
        head.copy_from_slice(&self.rbuf[..OptionReplyHeader::SIZE_BYTES]);
        let header = OptionReplyHeader::from_bytes(&head)?;
        let len = header.length as usize;
        if len > OPTION_REPLY_MAX_BYTES {
            return Err(NbdError::unexpected(format!(
                "{} reply of {len} bytes",
                option_name(header.option)
            ))
            .into());
        }
        if self.rbuf.len() < OptionReplyHeader::SIZE_BYTES + len {
            return Ok(false);
        }
        let mut frame = self.rbuf.split_to(OptionReplyHeader::SIZE_BYTES + len);
        frame.advance(OptionReplyHeader::SIZE_BYTES);
        let payload = frame.freeze();
        self.stats.record_received_chunk();

        if header.option != step.option() {
            return Err(NbdError::unexpected(format!(
                "reply to {} while waiting for {}",
                option_name(header.option),
                option_name(step.option())
            ))
            .into());
        }
        if header.is_error() {
            self.on_option_error(step, header.reply, &payload)?;
        } else {
            self.on_option_reply(step, header.reply, &payload)?;
        }
        Ok(true)
    }

    fn on_option_reply(&mut self, step: Step, reply: u32, payload: &[u8]) -> Result<()> {
        let goal = self.goal();
        match (step, reply) {
            (Step::StartTls, NBD_REP_ACK) => {
                self.upgrade_tls()?;
                self.negotiated.tls = true;
                if goal == Goal::Handshake {
                    self.advance(Stage::Tls)?;
                } else {
                    self.finish_round(Ok(Outcome::Flag(true)));
                }
            }
            (Step::StructuredReply, NBD_REP_ACK) => {
                self.negotiated.structured_replies = true;
                if goal == Goal::Handshake {
                    self.advance(Stage::Structured)?;
                } else {
                    self.finish_round(Ok(Outcome::Flag(true)));
                }
            }
            (Step::SetMeta | Step::ListMeta, NBD_REP_META_CONTEXT) => {
                let context = meta::decode_context_reply(payload)?;
                self.debug.emit(
                    "negotiate",
                    format_args!("server granted context {} = {}", context.id, context.name),
                );
                self.round_mut()?.contexts.push(context);
            }
            (Step::SetMeta, NBD_REP_ACK) => {
                let granted = std::mem::take(&mut self.round_mut()?.contexts);
                self.meta.finish_negotiation(granted.clone());
                if goal == Goal::SetMeta {
                    self.finish_round(Ok(Outcome::Contexts(granted)));
                } else {
                    self.advance(Stage::Meta)?;
                }
            }
            (Step::ListMeta, NBD_REP_ACK) => {
                let listed = std::mem::take(&mut self.round_mut()?.contexts);
                self.finish_round(Ok(Outcome::Contexts(listed)));
            }
            (Step::List, NBD_REP_SERVER) => {
                let entry = decode_server_reply(payload)?;
                self.round_mut()?.exports.push(entry);
            }
            (Step::List, NBD_REP_ACK) => {
                let exports = std::mem::take(&mut self.round_mut()?.exports);
                self.finish_round(Ok(Outcome::Exports(exports)));
            }
            (Step::Info | Step::Go, NBD_REP_INFO) => {
                let round = self.round_mut()?;
                decode_info_reply(&mut round.info, &mut round.have_export, payload)?;
            }
            (Step::Info | Step::Go, NBD_REP_ACK) => {
                let round = self.round_mut()?;
                if !round.have_export {
                    return Err(NbdError::unexpected("server sent no NBD_INFO_EXPORT").into());
                }
                let info = std::mem::take(&mut round.info);
                self.export = Some(info);
                if step == Step::Go {
                    self.enter_transmission();
                } else if self.settings.request_meta_context {
                    self.meta.settle_for_transmission();
                }
                self.finish_round(Ok(Outcome::Done));
            }
            (Step::Abort, _) => self.finish_closed(),
            _ => {
                return Err(NbdError::unexpected(format!(
                    "{} in reply to {}",
                    reply_name(reply),
                    option_name(step.option())
                ))
                .into());
            }
        }
        Ok(())
    }

    fn on_option_error(&mut self, step: Step, reply: u32, payload: &[u8]) -> Result<()> {
        let goal = self.goal();
        let option = step.option();
        let message = (!payload.is_empty()).then(|| String::from_utf8_lossy(payload).into_owned());
        let error = if reply == NBD_REP_ERR_UNSUP {
            NbdError::OptionUnsupported { option }
        } else {
            NbdError::OptionRejected {
                option,
                reply,
                message,
            }
        };
        self.debug
            .emit("negotiate", format_args!("server refused: {error}"));

        match step {
            Step::StartTls if goal == Goal::Handshake => {
                if self.settings.tls == TlsMode::Require {
                    return Err(Error::Tls {
                        reason: format!("server refused STARTTLS: {error}"),
                    });
                }
                self.advance(Stage::Tls)?;
            }
            Step::StartTls => self.finish_round(Ok(Outcome::Flag(false))),
            Step::StructuredReply => {
                self.negotiated.structured_replies = false;
                if goal == Goal::Handshake {
                    self.advance(Stage::Structured)?;
                } else {
                    self.finish_round(Ok(Outcome::Flag(false)));
                }
            }
            Step::SetMeta if goal != Goal::SetMeta => self.advance(Stage::Meta)?,
            Step::SetMeta | Step::ListMeta | Step::List => self.finish_round(Err(error.into())),
            Step::Go if reply == NBD_REP_ERR_UNSUP => self.send_step(Step::ExportName)?,
            Step::Info | Step::Go if goal == Goal::Handshake => return Err(error.into()),
            Step::Info | Step::Go => self.finish_round(Err(error.into())),
            Step::Abort => self.finish_closed(),
            Step::ExportName | Step::Greeting => {
                return Err(NbdError::unexpected("option error outside an option exchange").into());
            }
        }
        Ok(())
    }

    fn parse_export_name_reply(&mut self) -> Result<bool> {
        let pad = if self.negotiated.client_flags & NBD_FLAG_C_NO_ZEROES != 0 {
            0
        } else {
            NBD_ZERO_PAD_BYTES
        };
        if self.rbuf.len() < 10 + pad {
            return Ok(false);
        }
        let reply = self.rbuf.split_to(10 + pad);
        self.stats.record_received_chunk();
        self.export = Some(ExportInfo {
            size: be64(&reply[0..8]),
            flags: be16(&reply[8..10]),
            ..ExportInfo::default()
        });
        self.enter_transmission();
        self.finish_round(Ok(Outcome::Done));
        Ok(true)
    }

    fn upgrade_tls(&mut self) -> Result<()> {
        if !self.rbuf.is_empty() {
            return Err(NbdError::unexpected("plaintext data after STARTTLS").into());
        }
        let upgrader = self.tls_upgrade.as_mut().ok_or_else(|| Error::Tls {
            reason: "no TLS upgrade is configured".into(),
        })?;
        let transport = self
            .transport
            .take()
            .ok_or(Error::InvalidState {
                operation: "starttls",
                state: "closed",
            })?;
        let upgraded = upgrader
            .upgrade(transport, self.server_name.as_deref())
            .map_err(|e| Error::Tls {
                reason: e.to_string(),
            })?;
        self.transport = Some(upgraded);
        self.debug.emit("starttls", format_args!("TLS established"));
        Ok(())
    }
}

fn goal_name(goal: Goal) -> &'static str {
    match goal {
        Goal::Handshake => "connect",
        Goal::Go => "opt_go",
        Goal::Info => "opt_info",
        Goal::List => "opt_list",
        Goal::ListMeta => "opt_list_meta_context",
        Goal::SetMeta => "opt_set_meta_context",
        Goal::StructuredReply => "opt_structured_reply",
        Goal::StartTls => "opt_starttls",
        Goal::Abort => "opt_abort",
    }
}

/// Option data for INFO and GO.
fn encode_info_request(export_name: &str, full_info: bool) -> Vec<u8> {
    let mut requests = vec![NBD_INFO_BLOCK_SIZE];
    if full_info {
        requests.extend([NBD_INFO_NAME, NBD_INFO_DESCRIPTION]);
    }
    let mut data = Vec::with_capacity(6 + export_name.len() + 2 * requests.len());
    data.extend_from_slice(&(export_name.len() as u32).to_be_bytes());
    data.extend_from_slice(export_name.as_bytes());
    data.extend_from_slice(&(requests.len() as u16).to_be_bytes());
    for info in requests {
        data.extend_from_slice(&info.to_be_bytes());
    }
    data
}

fn decode_info_reply(
    info: &mut ExportInfo,
    have_export: &mut bool,
    payload: &[u8],
) -> std::result::Result<(), NbdError> {
    if payload.len() < 2 {
        return Err(NbdError::unexpected("NBD_REP_INFO too short"));
    }
    match be16(&payload[0..2]) {
        NBD_INFO_EXPORT => {
            if payload.len() != 12 {
                return Err(NbdError::unexpected("NBD_INFO_EXPORT has wrong length"));
            }
            info.size = be64(&payload[2..10]);
            info.flags = be16(&payload[10..12]);
            *have_export = true;
        }
        NBD_INFO_NAME => {
            info.canonical_name = Some(String::from_utf8_lossy(&payload[2..]).into_owned());
        }
        NBD_INFO_DESCRIPTION => {
            info.description = Some(String::from_utf8_lossy(&payload[2..]).into_owned());
        }
        NBD_INFO_BLOCK_SIZE => {
            if payload.len() != 14 {
                return Err(NbdError::unexpected("NBD_INFO_BLOCK_SIZE has wrong length"));
            }
            info.block_size = Some(BlockSize {
                minimum: be32(&payload[2..6]),
                preferred: be32(&payload[6..10]),
                maximum: be32(&payload[10..14]),
            });
        }
        // Unrequested information types are ignored.
        _ => {}
    }
    Ok(())
}

fn decode_server_reply(payload: &[u8]) -> std::result::Result<ExportEntry, NbdError> {
    if payload.len() < 4 {
        return Err(NbdError::unexpected("NBD_REP_SERVER too short"));
    }
    let name_len = be32(&payload[0..4]) as usize;
    let name = payload
        .get(4..4 + name_len)
        .ok_or_else(|| NbdError::unexpected("NBD_REP_SERVER name overruns reply"))?;
    Ok(ExportEntry {
        name: String::from_utf8_lossy(name).into_owned(),
        description: String::from_utf8_lossy(&payload[4 + name_len..]).into_owned(),
    })
}
