//! Handle configuration.
//!
//! Every field corresponds to a `Handle` setter; a config file is a
//! convenient way to apply a batch of them before connecting.
//!
//! ```toml
//! export_name = "disk0"
//! tls = "allow"
//! meta_contexts = ["base:allocation"]
//!
//! [strict]
//! align = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{NBD_FLAG_C_FIXED_NEWSTYLE, NBD_FLAG_C_NO_ZEROES};

/// Whether to negotiate TLS.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Never send STARTTLS.
    #[default]
    Disable,
    /// Upgrade if the server agrees, otherwise stay in plaintext.
    Allow,
    /// Fail the connection unless the upgrade succeeds.
    Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeFlags {
    pub fixed_newstyle: bool,
    pub no_zeroes: bool,
}

impl Default for HandshakeFlags {
    fn default() -> Self {
        Self {
            fixed_newstyle: true,
            no_zeroes: true,
        }
    }
}

impl HandshakeFlags {
    /// Client flags word for the wire.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.fixed_newstyle {
            bits |= NBD_FLAG_C_FIXED_NEWSTYLE;
        }
        if self.no_zeroes {
            bits |= NBD_FLAG_C_NO_ZEROES;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            fixed_newstyle: bits & NBD_FLAG_C_FIXED_NEWSTYLE != 0,
            no_zeroes: bits & NBD_FLAG_C_NO_ZEROES != 0,
        }
    }
}

/// Which requests are checked locally before being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrictMode {
    /// Reject commands the server did not advertise.
    pub commands: bool,
    /// Reject flags that are invalid for the command or not advertised.
    pub flags: bool,
    /// Reject requests past the end of the export.
    pub bounds: bool,
    /// Reject zero-length requests.
    pub zero_size: bool,
    /// Reject requests not aligned to the server's minimum block size.
    pub align: bool,
}

impl Default for StrictMode {
    fn default() -> Self {
        Self {
            commands: true,
            flags: true,
            bounds: true,
            zero_size: true,
            align: false,
        }
    }
}

impl StrictMode {
    /// Disable every optional check. Oversized requests are still refused.
    pub fn none() -> Self {
        Self {
            commands: false,
            flags: false,
            bounds: false,
            zero_size: false,
            align: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    pub export_name: String,
    pub tls: TlsMode,
    pub request_structured_replies: bool,
    pub request_meta_context: bool,
    pub meta_contexts: Vec<String>,
    pub opt_mode: bool,
    pub full_info: bool,
    pub handshake_flags: HandshakeFlags,
    pub strict: StrictMode,
    pub debug: bool,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            export_name: String::new(),
            tls: TlsMode::default(),
            request_structured_replies: true,
            request_meta_context: true,
            meta_contexts: Vec::new(),
            opt_mode: false,
            full_info: false,
            handshake_flags: HandshakeFlags::default(),
            strict: StrictMode::default(),
            debug: false,
        }
    }
}

/// NBD strings are limited to 4096 bytes.
const NBD_MAX_STRING: usize = 4096;

impl HandleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HandleConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.export_name.len() > NBD_MAX_STRING {
            return Err(ConfigError::InvalidValue {
                field: "export_name",
                reason: "must be at most 4096 bytes",
            });
        }
        if self
            .meta_contexts
            .iter()
            .any(|c| c.is_empty() || c.len() > NBD_MAX_STRING)
        {
            return Err(ConfigError::InvalidValue {
                field: "meta_contexts",
                reason: "names must be 1 to 4096 bytes",
            });
        }
        if self.request_meta_context
            && !self.meta_contexts.is_empty()
            && !self.request_structured_replies
        {
            return Err(ConfigError::InvalidValue {
                field: "request_meta_context",
                reason: "meta contexts require structured replies",
            });
        }
        if self.tls == TlsMode::Require && !self.handshake_flags.fixed_newstyle {
            return Err(ConfigError::InvalidValue {
                field: "tls",
                reason: "TLS requires the fixed newstyle handshake",
            });
        }
        Ok(())
    }
}
