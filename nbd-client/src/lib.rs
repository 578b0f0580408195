//! Non-blocking NBD (Network Block Device) client.
//!
//! A [`Handle`] connects to an NBD server, negotiates an export and then
//! multiplexes read, write, flush, trim, cache, write-zeroes and
//! block-status commands over one connection. The engine never blocks or
//! spawns threads on its own: the `aio_*` calls queue work and the caller
//! drives I/O with [`Handle::poll`] or by reporting readiness of
//! [`Handle::aio_get_fd`]. Blocking convenience wrappers are built on the
//! same loop.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod buffer;
mod command;
mod config;
mod debug;
mod engine;
mod error;
mod handle;
mod meta;
mod negotiate;
pub mod protocol;
mod stats;
mod transport;
mod uri;

pub use buffer::{Buffer, BufferSlice, Ownership};
pub use command::{
    ChunkCallback, ChunkKind, CommandFlags, CompletionAction, CompletionCallback, ErrorCell,
    Extent, ExtentCallback,
};
pub use config::{HandleConfig, HandshakeFlags, StrictMode, TlsMode};
pub use debug::DebugCallback;
pub use engine::{ConnectionState, Direction};
pub use error::{CallbackError, ConfigError, Error, NbdError, Result};
pub use handle::{Handle, ShutdownFlags};
pub use meta::MetaContext;
pub use negotiate::{BlockSize, BlockSizeKind, ExportEntry, ExportInfo, Protocol};
pub use stats::Stats;
pub use transport::{CommandTransport, TlsUpgrade, Transport};
pub use uri::{NBD_DEFAULT_PORT, NbdUri, UriTarget};

/// Library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Whether a built-in TLS implementation is available. TLS is supported
/// only through a caller-supplied [`TlsUpgrade`].
pub fn supports_tls() -> bool {
    false
}

pub fn supports_uri() -> bool {
    true
}
