//! Explicit logging context.
//!
//! The daemon's diagnostic output goes through a [`Logger`] value that is
//! built once at startup and handed to every component that reports
//! progress. It forwards to the `log` facade; the binary installs the sink.

use std::fmt::Arguments;

const TARGET: &str = "remapd";

/// Verbose and error sinks of the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    verbose: bool,
}

impl Logger {
    /// Create a logger; `verbose` enables the diagnostic sink.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// A logger that only reports errors.
    pub fn quiet() -> Self {
        Self { verbose: false }
    }

    /// Whether the diagnostic sink is enabled.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Diagnostic message, dropped unless verbose.
    pub fn verbose(&self, args: Arguments<'_>) {
        if self.verbose {
            log::info!(target: TARGET, "{args}");
        }
    }

    /// Error message, always emitted.
    pub fn error(&self, args: Arguments<'_>) {
        log::error!(target: TARGET, "{args}");
    }
}

/// `verbose!(logger, "fmt", args..)`
#[macro_export]
macro_rules! verbose {
    ($logger:expr, $($arg:tt)+) => {
        $logger.verbose(format_args!($($arg)+))
    };
}

/// `log_error!(logger, "fmt", args..)`
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $logger.error(format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_flags() {
        assert!(Logger::new(true).is_verbose());
        assert!(!Logger::quiet().is_verbose());
        // disabled sink is a no-op
        crate::verbose!(Logger::quiet(), "ignored {}", 1);
    }
}
