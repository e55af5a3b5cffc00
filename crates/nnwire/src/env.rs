use std::env;
use std::sync::OnceLock;

/// Default upper bound for a single encoded command frame.
pub const DEFAULT_MAX_COMMAND_BYTES: usize = 256 * 1024 * 1024;

/// Default upper bound on the results one operator may declare.
pub const DEFAULT_MAX_OPERATOR_OUTPUTS: usize = 4096;

static NNWIRE_MAX_COMMAND_BYTES: OnceLock<usize> = OnceLock::new();
static NNWIRE_MAX_OPERATOR_OUTPUTS: OnceLock<usize> = OnceLock::new();
static NNWIRE_TRACE_COMMANDS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, scale) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 1024),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .filter(|n| *n > 0)
}

pub(crate) fn max_command_bytes() -> usize {
    *NNWIRE_MAX_COMMAND_BYTES.get_or_init(|| match env::var("NNWIRE_MAX_COMMAND_BYTES") {
        Ok(value) => parse_size(&value).unwrap_or_else(|| {
            tracing::warn!(value = %value, "ignoring malformed NNWIRE_MAX_COMMAND_BYTES");
            DEFAULT_MAX_COMMAND_BYTES
        }),
        Err(_) => DEFAULT_MAX_COMMAND_BYTES,
    })
}

pub(crate) fn max_operator_outputs() -> usize {
    *NNWIRE_MAX_OPERATOR_OUTPUTS.get_or_init(|| match env::var("NNWIRE_MAX_OPERATOR_OUTPUTS") {
        Ok(value) => parse_size(&value).unwrap_or_else(|| {
            tracing::warn!(value = %value, "ignoring malformed NNWIRE_MAX_OPERATOR_OUTPUTS");
            DEFAULT_MAX_OPERATOR_OUTPUTS
        }),
        Err(_) => DEFAULT_MAX_OPERATOR_OUTPUTS,
    })
}

pub(crate) fn trace_commands() -> bool {
    *NNWIRE_TRACE_COMMANDS.get_or_init(|| match env::var("NNWIRE_TRACE_COMMANDS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Limits and toggles shared by both ends of a wire connection.
///
/// `Default` reads the process environment once; tests construct explicit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireConfig {
    /// Largest accepted frame payload in bytes. Larger frames are fatal on decode.
    pub max_command_bytes: usize,
    /// Most results a single operator may declare on the server's builders.
    pub max_operator_outputs: usize,
    /// Emits a `trace` event for every command sent or dispatched.
    pub trace_commands: bool,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_command_bytes: max_command_bytes(),
            max_operator_outputs: max_operator_outputs(),
            trace_commands: trace_commands(),
        }
    }
}

impl WireConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_max_command_bytes(mut self, limit: usize) -> Self {
        self.max_command_bytes = limit;
        self
    }

    pub fn with_max_operator_outputs(mut self, limit: usize) -> Self {
        self.max_operator_outputs = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes_with_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("8k"), Some(8 * 1024));
        assert_eq!(parse_size(" 2M "), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("0"), None);
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn parses_bools_loosely() {
        assert!(parse_bool("YES"));
        assert!(parse_bool(" on"));
        assert!(!parse_bool("off"));
    }
}
