// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::connection::Connection;
use crate::error::Error;
use crate::reference::Reference;
use crate::request::{AsyncStatus, Request};
use crate::request_handler::RequestHandler;
use crate::request_handler_factory::RequestHandlerFactory;

/// A client-side handle to a remote object.
///
/// Requests go through the proxy's request handler. With connection caching
/// the handler is kept across requests and is swapped for a direct handler
/// once the connection is established. Without caching a handler is
/// obtained for every request.
pub struct Proxy {
    this: Weak<Proxy>,
    reference: Reference,
    handler_factory: Arc<RequestHandlerFactory>,
    request_handler: Mutex<Option<Arc<dyn RequestHandler>>>,
}

impl Proxy {
    pub fn new(
        reference: Reference,
        handler_factory: Arc<RequestHandlerFactory>,
    ) -> Arc<Proxy> {
        Arc::new_cyclic(|this| Proxy {
            this: this.clone(),
            reference,
            handler_factory,
            request_handler: Mutex::new(None),
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub(crate) fn downgrade(&self) -> Weak<Proxy> {
        self.this.clone()
    }

    fn handler_lock(&self) -> MutexGuard<Option<Arc<dyn RequestHandler>>> {
        self.request_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The handler the next request will be sent through.
    pub fn request_handler(&self) -> Arc<dyn RequestHandler> {
        if self.reference.cache_connection() {
            if let Some(handler) = self.handler_lock().as_ref() {
                return Arc::clone(handler);
            }
        }
        self.handler_factory
            .get_request_handler(&self.reference, self)
    }

    /// Install `handler` unless the proxy already caches one. Returns the
    /// handler the proxy uses.
    pub fn set_request_handler(
        &self,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<dyn RequestHandler> {
        if self.reference.cache_connection() {
            let mut current = self.handler_lock();
            match current.as_ref() {
                Some(current) => return Arc::clone(current),
                None => *current = Some(Arc::clone(&handler)),
            }
        }
        handler
    }

    /// Replace `previous` with `replacement` if the proxy still uses
    /// `previous`. A `None` replacement makes the next request obtain a new
    /// handler.
    pub fn update_request_handler(
        &self,
        previous: &dyn RequestHandler,
        replacement: Option<Arc<dyn RequestHandler>>,
    ) {
        if !self.reference.cache_connection() {
            return;
        }
        let mut current = self.handler_lock();
        if let Some(handler) = current.take() {
            *current = handler.update(previous, replacement);
        }
    }

    /// Send `request` through the proxy's handler. A send failure clears the
    /// handler, fails the request and is returned.
    pub fn invoke(&self, request: &Arc<Request>) -> Result<AsyncStatus, Error> {
        let handler = self.request_handler();
        request.set_handler(&handler);
        match handler.send_async_request(request) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.update_request_handler(&*handler, None);
                request.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Send `request` and block until it completes.
    pub fn invoke_sync(
        &self,
        request: &Arc<Request>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.invoke(request)?;
        request.wait(timeout)
    }

    /// Cancel `request` through the handler it was sent through. A request
    /// still queued behind a connection attempt is dropped from the queue.
    pub fn cancel(&self, request: &Request) {
        request.cancel();
    }

    /// The connection the proxy's handler sends over, if one is established.
    pub fn connection(&self) -> Result<Option<Arc<dyn Connection>>, Error> {
        self.request_handler().connection()
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("reference", &self.reference.to_string())
            .finish()
    }
}
