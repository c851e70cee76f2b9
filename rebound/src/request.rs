// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use derive_more::{Display, From, Into};

use crate::error::Error;
use crate::request_handler::RequestHandler;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for an outgoing request.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct RequestId(u64);

/// The result of handing a request to a request handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsyncStatus {
    /// The request was buffered until a connection is available. The caller
    /// must wait for completion.
    Queued,
    /// The request was handed to a connection or dispatched in process.
    Sent,
}

/// Invoked once with the terminal outcome of a request.
pub type CompletionCallback =
    Box<dyn FnOnce(&Result<Vec<u8>, Error>) + Send + 'static>;

/// An outgoing invocation.
///
/// A request receives exactly one terminal outcome: the first call to
/// `complete` or `fail` wins and every later call is ignored. Callers either
/// block in `wait` or register a completion callback.
pub struct Request {
    id: RequestId,
    operation: String,
    payload: Vec<u8>,
    outcome: Mutex<Option<Result<Vec<u8>, Error>>>,
    done: Condvar,
    callback: Mutex<Option<CompletionCallback>>,
    // Released once the request has an outcome.
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
}

impl Request {
    pub fn new(operation: &str, payload: Vec<u8>) -> Arc<Request> {
        Arc::new(Request {
            id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            operation: String::from(operation),
            payload,
            outcome: Mutex::new(None),
            done: Condvar::new(),
            callback: Mutex::new(None),
            handler: Mutex::new(None),
        })
    }

    /// Create a request whose outcome is also delivered to `callback`.
    pub fn with_callback<F>(
        operation: &str,
        payload: Vec<u8>,
        callback: F,
    ) -> Arc<Request>
    where
        F: FnOnce(&Result<Vec<u8>, Error>) + Send + 'static,
    {
        let request = Request::new(operation, payload);
        *request
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
        request
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Complete the request with a reply. Returns false if the request already
    /// had an outcome.
    pub fn complete(&self, reply: Vec<u8>) -> bool {
        self.finish(Ok(reply))
    }

    /// Fail the request. Returns false if the request already had an outcome.
    pub fn fail(&self, error: Error) -> bool {
        self.finish(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.outcome_lock().is_some()
    }

    pub fn outcome(&self) -> Option<Result<Vec<u8>, Error>> {
        self.outcome_lock().clone()
    }

    /// Block until the request has an outcome. A `None` timeout waits
    /// indefinitely; an expired timeout yields `Error::InvocationTimeout`
    /// without changing the request's own outcome.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcome = self.outcome_lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::InvocationTimeout);
                    }
                    self.done
                        .wait_timeout(outcome, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .done
                    .wait(outcome)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Cancel the request. A request still queued behind a connection
    /// attempt is removed from that queue; the shared attempt itself is not
    /// affected.
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                handler.request_canceled(self, Error::InvocationCanceled)
            }
            None => {
                self.fail(Error::InvocationCanceled);
            }
        }
    }

    #[doc(hidden)]
    pub fn set_handler(&self, handler: &Arc<dyn RequestHandler>) {
        // Held across the store so `finish` cannot slip in between.
        let outcome = self.outcome_lock();
        if outcome.is_some() {
            return;
        }
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(handler));
    }

    fn outcome_lock(
        &self,
    ) -> std::sync::MutexGuard<Option<Result<Vec<u8>, Error>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, result: Result<Vec<u8>, Error>) -> bool {
        {
            let mut outcome = self.outcome_lock();
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(result.clone());
            self.done.notify_all();
        }

        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(&result);
        }
        true
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("payload_len", &self.payload.len())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::reference::Reference;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn first_outcome_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let request = Request::with_callback("ping", vec![1], move |r| {
            assert!(r.is_ok());
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(request.complete(vec![2]));
        assert!(!request.fail(Error::InvocationCanceled));
        assert!(!request.complete(vec![3]));

        assert_eq!(request.wait(None).unwrap(), vec![2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_times_out_without_outcome() {
        let request = Request::new("ping", Vec::new());
        match request.wait(Some(Duration::from_millis(20))) {
            Err(Error::InvocationTimeout) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!request.is_done());
    }

    #[test]
    fn wait_wakes_on_completion() {
        let request = Request::new("ping", Vec::new());
        let request_clone = request.clone();
        let t = thread::spawn(move || request_clone.wait(None));
        thread::sleep(Duration::from_millis(20));
        request.fail(Error::ConnectionLost(String::from("gone")));
        match t.join().unwrap() {
            Err(Error::ConnectionLost(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn cancel_without_handler_fails_request() {
        let request = Request::new("ping", Vec::new());
        request.cancel();
        match request.outcome() {
            Some(Err(Error::InvocationCanceled)) => (),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    struct IdleHandler(Reference);

    impl RequestHandler for IdleHandler {
        fn update(
            self: Arc<Self>,
            _previous: &dyn RequestHandler,
            _replacement: Option<Arc<dyn RequestHandler>>,
        ) -> Option<Arc<dyn RequestHandler>> {
            Some(self)
        }

        fn send_async_request(
            &self,
            _request: &Arc<Request>,
        ) -> Result<AsyncStatus, Error> {
            Ok(AsyncStatus::Queued)
        }

        fn request_canceled(&self, request: &Request, error: Error) {
            request.fail(error);
        }

        fn reference(&self) -> &Reference {
            &self.0
        }

        fn connection(&self) -> Result<Option<Arc<dyn Connection>>, Error> {
            Ok(None)
        }
    }

    #[test]
    fn finished_request_releases_handler() {
        let handler: Arc<dyn RequestHandler> =
            Arc::new(IdleHandler(Reference::new("idle", Vec::new())));

        let request = Request::new("ping", Vec::new());
        request.set_handler(&handler);
        assert_eq!(Arc::strong_count(&handler), 2);
        request.complete(Vec::new());
        assert_eq!(Arc::strong_count(&handler), 1);

        request.set_handler(&handler);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn completion_racing_set_handler_releases_handler() {
        let handler: Arc<dyn RequestHandler> =
            Arc::new(IdleHandler(Reference::new("idle", Vec::new())));

        for _ in 0..200 {
            let request = Request::new("ping", Vec::new());
            let completer = request.clone();
            let t = thread::spawn(move || completer.complete(Vec::new()));
            request.set_handler(&handler);
            assert!(t.join().unwrap());
            assert_eq!(Arc::strong_count(&handler), 1);
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = Request::new("a", Vec::new());
        let b = Request::new("b", Vec::new());
        assert_ne!(a.id(), b.id());
    }
}
