//! Per-dylib diagnostics accumulator.
//!
//! Adjustment of one dylib must not abort the rest of the build, so
//! malformed-input conditions are collected here instead of being returned
//! as hard errors. Once a sink holds an error, the owning pipeline stops
//! processing that dylib at the next checked phase boundary.

use tracing::warn;

/// An accumulator for errors and warnings encountered while processing a
/// single dylib.
///
/// Internal invariant violations are still `assert!`/`panic!` — this type is
/// only for conditions that can legitimately arise from bad input.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Diagnostics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error. Processing of the affected dylib should stop at the
    /// next checked boundary.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Records a warning. Warnings never stop processing.
    pub fn warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Returns true if any error has been recorded.
    #[inline]
    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the first recorded error, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    /// Returns all recorded errors.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Returns all recorded warnings.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Moves all errors and warnings from `other` into `self`.
    pub fn absorb(&mut self, other: Diagnostics) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_state() {
        let mut diag = Diagnostics::new();
        assert!(!diag.has_error());

        diag.warning("just a warning");
        assert!(!diag.has_error());

        diag.error("bad split seg kind");
        assert!(diag.has_error());
        assert_eq!(diag.first_error(), Some("bad split seg kind"));
    }

    #[test]
    fn test_absorb() {
        let mut a = Diagnostics::new();
        let mut b = Diagnostics::new();
        b.error("from b");
        a.absorb(b);
        assert!(a.has_error());
    }
}
