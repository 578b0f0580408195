//! Meta context bookkeeping.
//!
//! Two independent ordered sets are kept per handle: the contexts the caller
//! asked for (sticky, only cleared explicitly) and the contexts the server
//! granted in the most recent completed `NBD_OPT_SET_META_CONTEXT` round.
//! Query matching (wildcards, prefixes) is server policy; the client only
//! forwards query strings and records what comes back.

use crate::error::{Error, Result};
use crate::protocol::{NbdError, be32};

/// A context granted by the server: the id it uses in block status replies
/// and the context name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaContext {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Default)]
pub(crate) struct MetaContexts {
    requested: Vec<String>,
    /// `None` until a negotiation completes, and again while a new SET round
    /// is in progress.
    negotiated: Option<Vec<MetaContext>>,
}

impl MetaContexts {
    /// Add a context to the requested set. Duplicate names are ignored.
    pub(crate) fn request(&mut self, name: &str) {
        if !self.requested.iter().any(|n| n == name) {
            self.requested.push(name.to_string());
        }
    }

    pub(crate) fn clear_requested(&mut self) {
        self.requested.clear();
    }

    pub(crate) fn requested(&self) -> &[String] {
        &self.requested
    }

    pub(crate) fn negotiated(&self) -> Option<&[MetaContext]> {
        self.negotiated.as_deref()
    }

    /// Forget the previous negotiation at the start of a SET round.
    pub(crate) fn begin_negotiation(&mut self) {
        self.negotiated = None;
    }

    pub(crate) fn finish_negotiation(&mut self, granted: Vec<MetaContext>) {
        self.negotiated = Some(granted);
    }

    /// Entering transmission without a SET round leaves an empty, but
    /// completed, negotiation.
    pub(crate) fn settle_for_transmission(&mut self) {
        if self.negotiated.is_none() {
            self.negotiated = Some(Vec::new());
        }
    }

    /// Whether `name` was granted by the most recent negotiation.
    pub(crate) fn can(&self, name: &str) -> Result<bool> {
        match &self.negotiated {
            None => Err(Error::MetaContextsNotNegotiated),
            Some(granted) => Ok(granted.iter().any(|c| c.name == name)),
        }
    }

    /// Resolve a context id from a block status reply.
    pub(crate) fn name_of(&self, id: u32) -> Option<&str> {
        self.negotiated
            .as_ref()?
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.as_str())
    }
}

/// Option data for LIST_META_CONTEXT and SET_META_CONTEXT.
pub(crate) fn encode_queries(export_name: &str, queries: &[String]) -> Vec<u8> {
    let len = 8 + export_name.len() + queries.iter().map(|q| 4 + q.len()).sum::<usize>();
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&(export_name.len() as u32).to_be_bytes());
    data.extend_from_slice(export_name.as_bytes());
    data.extend_from_slice(&(queries.len() as u32).to_be_bytes());
    for query in queries {
        data.extend_from_slice(&(query.len() as u32).to_be_bytes());
        data.extend_from_slice(query.as_bytes());
    }
    data
}

/// Decode an `NBD_REP_META_CONTEXT` payload.
pub(crate) fn decode_context_reply(payload: &[u8]) -> std::result::Result<MetaContext, NbdError> {
    if payload.len() < 4 {
        return Err(NbdError::unexpected("meta context reply too short"));
    }
    let id = be32(&payload[0..4]);
    let name = String::from_utf8(payload[4..].to_vec())
        .map_err(|_| NbdError::unexpected("meta context name is not UTF-8"))?;
    Ok(MetaContext { id, name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CONTEXT_BASE_ALLOCATION;

    #[test]
    fn requested_set_is_ordered_and_deduplicated() {
        let mut meta = MetaContexts::default();
        meta.request("x-b:one");
        meta.request(CONTEXT_BASE_ALLOCATION);
        meta.request("x-b:one");
        assert_eq!(meta.requested(), &["x-b:one", CONTEXT_BASE_ALLOCATION]);
        meta.clear_requested();
        assert!(meta.requested().is_empty());
    }

    #[test]
    fn can_distinguishes_never_negotiated_from_not_granted() {
        let mut meta = MetaContexts::default();
        assert!(matches!(
            meta.can(CONTEXT_BASE_ALLOCATION),
            Err(Error::MetaContextsNotNegotiated)
        ));

        meta.finish_negotiation(vec![]);
        assert!(!meta.can(CONTEXT_BASE_ALLOCATION).unwrap());

        meta.begin_negotiation();
        assert!(meta.can(CONTEXT_BASE_ALLOCATION).is_err());

        meta.finish_negotiation(vec![MetaContext {
            id: 7,
            name: CONTEXT_BASE_ALLOCATION.to_string(),
        }]);
        assert!(meta.can(CONTEXT_BASE_ALLOCATION).unwrap());
        assert_eq!(meta.name_of(7), Some(CONTEXT_BASE_ALLOCATION));
        assert_eq!(meta.name_of(8), None);
    }

    #[test]
    fn transmission_settles_empty_negotiation_only_once() {
        let mut meta = MetaContexts::default();
        meta.settle_for_transmission();
        assert_eq!(meta.negotiated(), Some(&[][..]));

        meta.finish_negotiation(vec![MetaContext {
            id: 1,
            name: "a".into(),
        }]);
        meta.settle_for_transmission();
        assert_eq!(meta.negotiated().map(|n| n.len()), Some(1));
    }

    #[test]
    fn query_encoding() {
        let data = encode_queries("disk", &["base:".to_string()]);
        assert_eq!(&data[0..4], &4u32.to_be_bytes());
        assert_eq!(&data[4..8], b"disk");
        assert_eq!(&data[8..12], &1u32.to_be_bytes());
        assert_eq!(&data[12..16], &5u32.to_be_bytes());
        assert_eq!(&data[16..], b"base:");
    }

    #[test]
    fn context_reply_decoding() {
        let mut payload = 3u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"base:allocation");
        let ctx = decode_context_reply(&payload).unwrap();
        assert_eq!(ctx.id, 3);
        assert_eq!(ctx.name, "base:allocation");
        assert!(decode_context_reply(&[0, 1]).is_err());
    }
}
