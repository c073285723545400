/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An explicit logging sink, passed through the engine by value rather than
//! relying on a process-wide logger singleton. Informational messages are
//! routed to one writer (normally stdout), warnings and errors to another
//! (normally stderr) -- the same split `exodus_bundler.cli.configure_logging`
//! makes with its `StdoutFilter`/`StderrFilter` pair.

use std::io::Write;
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Quiet,
    Normal,
    Verbose,
}

pub struct Logger {
    level: Level,
    info_sink: Mutex<Box<dyn Write + Send>>,
    warn_sink: Mutex<Box<dyn Write + Send>>,
}

impl Logger {
    pub fn new(level: Level) -> Self {
        Self::with_sinks(level, Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    pub fn with_sinks(
        level: Level,
        info_sink: Box<dyn Write + Send>,
        warn_sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            level,
            info_sink: Mutex::new(info_sink),
            warn_sink: Mutex::new(warn_sink),
        }
    }

    /// A logger whose info sink is discarded entirely, used when the bundle
    /// itself is being streamed to standard output.
    pub fn suppressing_stdout(level: Level) -> Self {
        Self::with_sinks(level, Box::new(std::io::sink()), Box::new(std::io::stderr()))
    }

    pub fn info(&self, message: &str) {
        if self.level == Level::Quiet {
            return;
        }
        if let Ok(mut sink) = self.info_sink.lock() {
            let _ = writeln!(sink, "{message}");
        }
        tracing::info!("{message}");
    }

    pub fn verbose(&self, message: &str) {
        if self.level != Level::Verbose {
            tracing::debug!("{message}");
            return;
        }
        if let Ok(mut sink) = self.info_sink.lock() {
            let _ = writeln!(sink, "{message}");
        }
        tracing::info!("{message}");
    }

    pub fn warn(&self, message: &str) {
        if let Ok(mut sink) = self.warn_sink.lock() {
            let _ = writeln!(sink, "WARNING: {message}");
        }
        tracing::warn!("{message}");
    }

    pub fn error(&self, message: &str) {
        if let Ok(mut sink) = self.warn_sink.lock() {
            let _ = writeln!(sink, "ERROR: {message}");
        }
        tracing::error!("{message}");
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Level::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn quiet_suppresses_info_but_not_warn() {
        let info = SharedBuf::default();
        let warn = SharedBuf::default();
        let logger = Logger::with_sinks(Level::Quiet, Box::new(info.clone()), Box::new(warn.clone()));
        logger.info("should not appear");
        logger.warn("should appear");
        assert!(info.0.lock().unwrap().is_empty());
        assert!(String::from_utf8(warn.0.lock().unwrap().clone())
            .unwrap()
            .contains("should appear"));
    }

    #[test]
    fn verbose_only_emits_in_verbose_mode() {
        let info = SharedBuf::default();
        let warn = SharedBuf::default();
        let logger = Logger::with_sinks(Level::Normal, Box::new(info.clone()), Box::new(warn.clone()));
        logger.verbose("debug detail");
        assert!(info.0.lock().unwrap().is_empty());

        let info2 = SharedBuf::default();
        let logger2 = Logger::with_sinks(Level::Verbose, Box::new(info2.clone()), Box::new(warn));
        logger2.verbose("debug detail");
        assert!(String::from_utf8(info2.0.lock().unwrap().clone())
            .unwrap()
            .contains("debug detail"));
    }
}
