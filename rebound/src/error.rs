/*
 * Copyright 2020 Joyent, Inc.
 */

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// The errors surfaced by the connection factory, the request handlers and
/// the transports plugged into them.
///
/// A single terminal failure is commonly broadcast to every waiter of a
/// coalesced connection attempt and to every request queued behind it, so
/// `Error` is `Clone`. I/O errors are held behind an `Arc` for that reason.
#[derive(Clone, Debug)]
pub enum Error {
    /// The connection factory has been destroyed.
    FactoryDestroyed,
    /// A connection was requested for an empty endpoint list.
    NoEndpoints,
    /// An endpoint could not be resolved into any connector.
    ResolutionFailure(String),
    /// A transport connection attempt or its handshake failed.
    ConnectFailure(String),
    /// A transport connection attempt did not complete in time.
    ConnectTimeout(String),
    /// An established connection was lost or closed.
    ConnectionLost(String),
    /// The invocation was canceled by its caller.
    InvocationCanceled,
    /// The invocation did not complete in time.
    InvocationTimeout,
    /// An object adapter with the same name is already registered.
    AdapterAlreadyRegistered(String),
    /// An endpoint string could not be parsed.
    InvalidEndpoint(String),
    /// A reference string could not be parsed.
    InvalidReference(String),
    IOError(Arc<std::io::Error>),
}

impl Error {
    /// Whether the error is a network level failure that may be retried
    /// against another connector or endpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ResolutionFailure(_)
            | Error::ConnectFailure(_)
            | Error::ConnectTimeout(_)
            | Error::ConnectionLost(_)
            | Error::IOError(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IOError(Arc::new(error))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::FactoryDestroyed => {
                fmt.write_str("connection factory destroyed")
            }
            Error::NoEndpoints => fmt.write_str("no endpoints to connect to"),
            Error::ResolutionFailure(err_str) => {
                write!(fmt, "endpoint resolution failed: {}", err_str)
            }
            Error::ConnectFailure(err_str) => {
                write!(fmt, "connect failed: {}", err_str)
            }
            Error::ConnectTimeout(err_str) => {
                write!(fmt, "connect timed out: {}", err_str)
            }
            Error::ConnectionLost(err_str) => {
                write!(fmt, "connection lost: {}", err_str)
            }
            Error::InvocationCanceled => fmt.write_str("invocation canceled"),
            Error::InvocationTimeout => fmt.write_str("invocation timed out"),
            Error::AdapterAlreadyRegistered(name) => {
                write!(fmt, "object adapter {} already registered", name)
            }
            Error::InvalidEndpoint(err_str) => {
                write!(fmt, "invalid endpoint: {}", err_str)
            }
            Error::InvalidReference(err_str) => {
                write!(fmt, "invalid reference: {}", err_str)
            }
            Error::IOError(io_err) => write!(fmt, "{}", io_err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::IOError(io_err) => Some(io_err.as_ref()),
            _ => None,
        }
    }
}
