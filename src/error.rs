// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Errors produced by the runtime and its suspension points.
///
/// Every awaitable in this crate resolves to a `Result<_, Error>`; the
/// cancellation kinds (`Cancelled`, `Deadline`) are returned promptly by any
/// suspension point once the owning task has been cancelled.
#[derive(Debug)]
pub enum Error {
    /// Cooperative cancellation was observed.
    Cancelled,
    /// Timer-induced cancellation.
    Deadline,
    /// A bounded resource (task frames, registrations) is exhausted.
    ResourceExhausted(&'static str),
    /// Component construction requested a component that is already under
    /// construction. Carries the construction stack, outermost first.
    DependencyCycle(Vec<String>),
    /// Component construction requested a name nobody registered.
    DependencyMissing(String),
    /// Name resolution produced no usable answer.
    NotResolved,
    /// An I/O error from the reactor or a socket.
    NetworkFailure(io::Error),
    /// A server answered with a failure code (DNS rcode and the like).
    ServerFailure(u8),
    /// A task body panicked; the payload message is preserved.
    Panicked(String),
    /// An internal invariant was violated. Fatal.
    Invariant(&'static str),
    /// Wrapper for component-defined errors.
    User(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Whether this error is one of the cancellation kinds.
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Deadline)
    }

    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::User(Box::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => f.write_str("task was cancelled"),
            Error::Deadline => f.write_str("deadline reached"),
            Error::ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
            Error::DependencyCycle(stack) => {
                write!(f, "component dependency cycle: {}", stack.join(" -> "))
            }
            Error::DependencyMissing(name) => write!(f, "no such component: {name}"),
            Error::NotResolved => f.write_str("name could not be resolved"),
            Error::NetworkFailure(err) => write!(f, "network failure: {err}"),
            Error::ServerFailure(code) => write!(f, "server failure (code {code})"),
            Error::Panicked(msg) => write!(f, "task panicked: {msg}"),
            Error::Invariant(what) => write!(f, "invariant violated: {what}"),
            Error::User(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::NetworkFailure(err) => Some(err),
            Error::User(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::NetworkFailure(err)
    }
}
