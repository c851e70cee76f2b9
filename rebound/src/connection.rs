/*
 * Copyright 2020 Joyent, Inc.
 */

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::{AsyncStatus, Request};

/// The lifecycle states of a transport connection.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ConnectionState {
    /// The handshake is in flight.
    Validating,
    /// The connection is usable.
    Active,
    Closing,
    Closed,
    /// Closed and all of the connection's resources have been released.
    Finished,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Validating => fmt.write_str("validating"),
            ConnectionState::Active => fmt.write_str("active"),
            ConnectionState::Closing => fmt.write_str("closing"),
            ConnectionState::Closed => fmt.write_str("closed"),
            ConnectionState::Finished => fmt.write_str("finished"),
        }
    }
}

/// Addressing details of a connection, for instrumentation.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    pub connection_type: String,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
}

/// Completion of a connection's handshake.
pub type StartCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Transport connection
///
/// A `Connection` is a live or connecting transport session to exactly one
/// connector. Once pooled it may be shared by many proxies and used for many
/// concurrent requests, so every method takes `&self`.
///
/// The connection factory drives a connection through `start`, which must
/// invoke its callback exactly once: with `Ok(())` when the handshake
/// succeeds, or with the failure otherwise. Closing a connection whose
/// handshake is still in flight must fail that handshake with the close
/// reason. Connect timeouts are enforced by the connection itself and are
/// reported as `Error::ConnectTimeout`.
pub trait Connection: Send + Sync {
    /// The connector this connection was established to.
    fn connector(&self) -> &Connector;
    /// The endpoint whose resolution produced the connector.
    fn endpoint(&self) -> &Endpoint;
    /// A short transport name such as `tcp`.
    fn connection_type(&self) -> &str;
    fn state(&self) -> ConnectionState;
    /// Begin the handshake.
    fn start(&self, callback: StartCallback);
    /// Mark a connection whose handshake succeeded as usable.
    fn activate(&self);
    /// Hand a request to the connection.
    fn send_async_request(
        &self,
        request: &Arc<Request>,
        compress: bool,
    ) -> Result<AsyncStatus, Error>;
    /// Abandon an in-flight request. The default implementation fails the
    /// request with `error`.
    fn request_canceled(&self, request: &Request, error: Error) {
        request.fail(error);
    }
    /// Initiate a close. Does not block.
    fn close(&self, reason: Error);
    /// Block until the connection has reached `ConnectionState::Finished`.
    fn wait_until_finished(&self);
    /// The name of the object adapter dispatching incoming requests on this
    /// connection, if any.
    fn adapter(&self) -> Option<String>;
    fn set_adapter(&self, adapter: Option<String>);
    fn info(&self) -> ConnectionInfo;
    /// Refresh any instrumentation attached to the connection.
    fn update_observer(&self) {}

    /// Whether the connection may be handed out for new requests.
    fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Whether the connection has been fully closed.
    fn is_closed(&self) -> bool {
        self.state() >= ConnectionState::Closed
    }
}

/// Creates transport connections for connectors.
///
/// `create_connection` only builds the connection object. The socket work
/// belongs to `Connection::start` so that it runs outside of the factory's
/// lock. An error returned here is treated as a failed attempt against this
/// connector.
pub trait Transport: Send + Sync {
    fn create_connection(
        &self,
        connector: &Connector,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>, Error>;
}

/// Whether two handles refer to the same connection object.
pub fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
