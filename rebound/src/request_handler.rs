// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use crate::adapter::ObjectAdapter;
use crate::connection::{same_connection, Connection};
use crate::error::Error;
use crate::reference::Reference;
use crate::request::{AsyncStatus, Request};

/// Request handler
///
/// A proxy sends every request through a request handler. The handler is
/// either a transient [`ConnectRequestHandler`] that buffers requests while a
/// connection is established, a [`ConnectionRequestHandler`] that forwards to
/// an established connection, or a [`CollocatedRequestHandler`] that
/// dispatches in process.
///
/// [`ConnectRequestHandler`]: ../connect_request_handler/struct.ConnectRequestHandler.html
/// [`ConnectionRequestHandler`]: struct.ConnectionRequestHandler.html
/// [`CollocatedRequestHandler`]: struct.CollocatedRequestHandler.html
pub trait RequestHandler: Send + Sync {
    /// Reconcile the handler a proxy holds (`self`) with a replacement. If
    /// `previous` is this handler the replacement is returned, otherwise this
    /// handler stays canonical. A `None` replacement clears the proxy's
    /// handler.
    fn update(
        self: Arc<Self>,
        previous: &dyn RequestHandler,
        replacement: Option<Arc<dyn RequestHandler>>,
    ) -> Option<Arc<dyn RequestHandler>>;

    fn send_async_request(
        &self,
        request: &Arc<Request>,
    ) -> Result<AsyncStatus, Error>;

    fn request_canceled(&self, request: &Request, error: Error);

    fn reference(&self) -> &Reference;

    /// The connection requests are sent over, once known. Returns the
    /// connection failure if the connection could not be established.
    fn connection(&self) -> Result<Option<Arc<dyn Connection>>, Error>;
}

/// Whether two handler references point at the same handler object.
pub fn same_handler(a: &dyn RequestHandler, b: &dyn RequestHandler) -> bool {
    a as *const _ as *const () == b as *const _ as *const ()
}

/// Forwards requests to an established connection.
pub struct ConnectionRequestHandler {
    reference: Reference,
    connection: Arc<dyn Connection>,
    compress: bool,
}

impl ConnectionRequestHandler {
    pub fn new(
        reference: Reference,
        connection: Arc<dyn Connection>,
        compress: bool,
    ) -> Self {
        ConnectionRequestHandler {
            reference,
            connection,
            compress,
        }
    }
}

impl RequestHandler for ConnectionRequestHandler {
    fn update(
        self: Arc<Self>,
        previous: &dyn RequestHandler,
        replacement: Option<Arc<dyn RequestHandler>>,
    ) -> Option<Arc<dyn RequestHandler>> {
        if same_handler(previous, &*self) {
            return replacement;
        }
        // Handlers over the same connection are interchangeable.
        if let Ok(Some(connection)) = previous.connection() {
            if same_connection(&connection, &self.connection) {
                return replacement;
            }
        }
        Some(self)
    }

    fn send_async_request(
        &self,
        request: &Arc<Request>,
    ) -> Result<AsyncStatus, Error> {
        self.connection.send_async_request(request, self.compress)
    }

    fn request_canceled(&self, request: &Request, error: Error) {
        self.connection.request_canceled(request, error)
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn connection(&self) -> Result<Option<Arc<dyn Connection>>, Error> {
        Ok(Some(Arc::clone(&self.connection)))
    }
}

/// Dispatches requests synchronously into a local object adapter, bypassing
/// the network.
pub struct CollocatedRequestHandler {
    reference: Reference,
    adapter: Arc<dyn ObjectAdapter>,
}

impl CollocatedRequestHandler {
    pub fn new(reference: Reference, adapter: Arc<dyn ObjectAdapter>) -> Self {
        CollocatedRequestHandler { reference, adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn ObjectAdapter> {
        &self.adapter
    }
}

impl RequestHandler for CollocatedRequestHandler {
    fn update(
        self: Arc<Self>,
        previous: &dyn RequestHandler,
        replacement: Option<Arc<dyn RequestHandler>>,
    ) -> Option<Arc<dyn RequestHandler>> {
        if same_handler(previous, &*self) {
            replacement
        } else {
            Some(self)
        }
    }

    fn send_async_request(
        &self,
        request: &Arc<Request>,
    ) -> Result<AsyncStatus, Error> {
        match self.adapter.dispatch(self.reference.identity(), request) {
            Ok(reply) => request.complete(reply),
            Err(e) => request.fail(e),
        };
        Ok(AsyncStatus::Sent)
    }

    fn request_canceled(&self, request: &Request, error: Error) {
        request.fail(error);
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn connection(&self) -> Result<Option<Arc<dyn Connection>>, Error> {
        Ok(None)
    }
}
