// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handle writing formatted lines to stderr

use std::io::Write;

use super::{Facility, Severity};

/// Logger handle for writing log messages.
///
/// This is a lightweight handle that can be cloned and passed around.
/// Debug messages are suppressed unless the handle's debug gate is on;
/// `scoped()` derives a handle with a widened gate so per-interface and
/// per-host `debug` configuration can enable tracing for one scope only.
#[derive(Clone)]
pub struct Logger {
    debug: bool,
}

impl Logger {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Derive a handle for a configuration scope. The global debug flag
    /// always wins; a scope can only add debug output, never remove it.
    pub fn scoped(&self, debug: bool) -> Self {
        Self {
            debug: self.debug || debug,
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if severity == Severity::Debug && !self.debug {
            return;
        }
        // Single write so concurrent tasks do not interleave lines.
        let line = format!("{:<5} [{}] {}\n", severity.as_str(), facility.as_str(), message);
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_basic() {
        let logger = Logger::new(false);
        logger.info(Facility::Test, "info message");
        logger.error(Facility::Test, "error message");
    }

    #[test]
    fn test_logger_clone() {
        let logger1 = Logger::new(true);
        let logger2 = logger1.clone();
        assert!(logger2.debug_enabled());
        logger2.debug(Facility::Test, "from clone");
    }

    #[test]
    fn test_scoped_gate_widens_only() {
        let quiet = Logger::new(false);
        assert!(!quiet.debug_enabled());
        assert!(quiet.scoped(true).debug_enabled());
        assert!(!quiet.scoped(false).debug_enabled());

        let verbose = Logger::new(true);
        assert!(verbose.scoped(false).debug_enabled());
    }
}
