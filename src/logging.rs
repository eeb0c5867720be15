// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Logging sinks.
//!
//! A `tracing-subscriber` fmt layer writes either to stderr or to a file
//! whose handle can be reopened in place — the `SIGUSR1` rotation path:
//! an external rotator renames the file, signals the process, and
//! [`LogHandle::rotate`] reopens the original path.

use crate::config::LoggingConfig;
use crate::error::Error;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

struct ReopenableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReopenableFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = Self::open_file(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn open_file(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn reopen(&self) -> io::Result<()> {
        let fresh = Self::open_file(&self.path)?;
        *self.file.lock() = fresh;
        Ok(())
    }
}

#[derive(Clone)]
struct FileSink(Arc<ReopenableFile>);

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Handle to the installed sinks; keeps the rotation target.
#[derive(Clone, Default)]
pub struct LogHandle {
    file: Option<Arc<ReopenableFile>>,
}

impl LogHandle {
    /// Reopen every file sink in place. No-op for stderr logging.
    pub fn rotate(&self) -> Result<(), Error> {
        if let Some(file) = &self.file {
            file.reopen().map_err(Error::NetworkFailure)?;
            tracing::info!(path = %file.path.display(), "log file reopened");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("file", &self.file.as_ref().map(|file| file.path.display().to_string()))
            .finish()
    }
}

/// Install the global subscriber per `config`.
///
/// A subscriber installed earlier (tests, embedding applications) is kept;
/// the returned handle still owns the rotation target, if any.
pub fn init(config: &LoggingConfig) -> Result<LogHandle, Error> {
    let filter = match &config.level {
        Some(level) => EnvFilter::try_new(level).map_err(Error::user)?,
        None => EnvFilter::from_default_env(),
    };

    let handle = match &config.file {
        Some(path) => {
            let file = Arc::new(ReopenableFile::open(path.clone()).map_err(Error::NetworkFailure)?);
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(FileSink(Arc::clone(&file)))
                .with_ansi(false)
                .finish();
            install(subscriber);
            LogHandle { file: Some(file) }
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .finish();
            install(subscriber);
            LogHandle::default()
        }
    };

    Ok(handle)
}

fn install(subscriber: impl tracing::Subscriber + Send + Sync + 'static) {
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("a global subscriber is already installed; keeping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_reopens_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.log");

        let file = Arc::new(ReopenableFile::open(path.clone()).unwrap());
        let mut sink = FileSink(Arc::clone(&file));
        writeln!(sink, "before rotation").unwrap();

        // simulate logrotate: move the live file away, reopen the path
        let rotated = dir.path().join("service.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        file.reopen().unwrap();
        writeln!(sink, "after rotation").unwrap();
        sink.flush().unwrap();

        assert!(std::fs::read_to_string(&rotated).unwrap().contains("before rotation"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("after rotation"));
    }

    #[test]
    fn rotate_without_a_file_is_a_no_op() {
        let handle = LogHandle::default();
        handle.rotate().unwrap();
    }
}
