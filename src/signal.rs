// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! OS signal delivery for the run loop.
//!
//! `signal-hook`'s iterator runs on a dedicated thread and forwards the
//! signals the manager cares about over a channel. `SIGHUP` is registered but
//! reserved; the manager ignores it.

use crate::error::Error;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGINT` or `SIGTERM`: graceful shutdown.
    Terminate,
    /// `SIGUSR1`: reopen the logging sinks.
    RotateLogs,
    /// `SIGHUP`: reserved.
    Hangup,
}

pub struct SignalListener {
    rx: mpsc::Receiver<Signal>,
    handle: signal_hook::iterator::Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SignalListener {
    pub fn install() -> Result<Self, Error> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGHUP])?;
        let handle = signals.handle();
        let (tx, rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("signal-listener".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    let mapped = match signal {
                        SIGINT | SIGTERM => Signal::Terminate,
                        SIGUSR1 => Signal::RotateLogs,
                        SIGHUP => Signal::Hangup,
                        _ => continue,
                    };
                    if tx.send(mapped).is_err() {
                        break;
                    }
                }
            })
            .map_err(Error::NetworkFailure)?;

        Ok(Self {
            rx,
            handle,
            thread: Some(thread),
        })
    }

    /// Block until the next signal arrives; `None` once the listener closed.
    pub fn recv(&self) -> Option<Signal> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalListener").finish_non_exhaustive()
    }
}
