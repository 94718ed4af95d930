//! Helper for logging an error and its chain of sources inline.
//!
//! Vendored locally to match the public `slog-error-chain` crate API used by
//! the workspace. Provides [`InlineErrorChain`], which formats an error
//! together with its `source()` chain and can be used both as a `Display`
//! value and directly as a `slog` key-value pair.

use std::error::Error;
use std::fmt;

/// Wraps an error reference and renders it together with its full chain of
/// sources, separated by `": "`.
pub struct InlineErrorChain<'a> {
    start: &'a (dyn Error + 'a),
}

impl<'a> InlineErrorChain<'a> {
    /// Create a new `InlineErrorChain` for the given error.
    pub fn new(start: &'a (dyn Error + 'a)) -> Self {
        Self { start }
    }
}

impl fmt::Display for InlineErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)?;
        let mut current = self.start.source();
        while let Some(err) = current {
            write!(f, ": {}", err)?;
            current = err.source();
        }
        Ok(())
    }
}

impl slog::KV for InlineErrorChain<'_> {
    fn serialize(
        &self,
        _record: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments("error", &format_args!("{self}"))
    }
}
