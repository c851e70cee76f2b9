// Copyright 2020 Joyent, Inc.

//! A rebound transport over `std::net::TcpStream`.
//!
//! The handshake is a TCP connect run on its own thread, bounded by the
//! connector's timeout. Requests are written to the stream as raw payload
//! bytes and complete with an empty reply once written; message framing is
//! left to the layers above.

use std::io::{ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use slog::{debug, o, warn, Drain, Logger};

use rebound::connection::{
    Connection, ConnectionInfo, ConnectionState, StartCallback, Transport,
};
use rebound::connector::Connector;
use rebound::endpoint::Endpoint;
use rebound::error::Error;
use rebound::request::{AsyncStatus, Request};

/// Creates `TcpStreamConnection`s.
pub struct TcpTransport {
    log: Logger,
}

impl TcpTransport {
    pub fn new(log: Option<Logger>) -> Self {
        let log = log.unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        TcpTransport { log }
    }
}

impl Transport for TcpTransport {
    fn create_connection(
        &self,
        connector: &Connector,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>, Error> {
        if endpoint.secure() {
            return Err(Error::ConnectFailure(format!(
                "{} is not supported by the tcp transport",
                endpoint.protocol
            )));
        }
        Ok(Arc::new(TcpStreamConnection::new(
            connector.clone(),
            endpoint.clone(),
            self.log.new(o!("connector" => connector.to_string())),
        )))
    }
}

struct StreamData {
    state: ConnectionState,
    stream: Option<TcpStream>,
    pending_start: Option<StartCallback>,
    adapter: Option<String>,
}

struct Inner {
    connector: Connector,
    endpoint: Endpoint,
    data: Mutex<StreamData>,
    finished: Condvar,
    log: Logger,
}

impl Inner {
    fn data_lock(&self) -> MutexGuard<StreamData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) {
        let address = self.connector.address;
        let result = match self.connector.timeout {
            Some(timeout) => TcpStream::connect_timeout(&address, timeout),
            None => TcpStream::connect(address),
        };

        let (callback, result) = {
            let mut data = self.data_lock();
            if data.state != ConnectionState::Validating {
                // Closed while connecting. The close reported the failure.
                return;
            }
            let result = match result {
                Ok(stream) => {
                    data.stream = Some(stream);
                    Ok(())
                }
                Err(e) => {
                    data.state = ConnectionState::Finished;
                    self.finished.notify_all();
                    Err(match e.kind() {
                        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                            Error::ConnectTimeout(address.to_string())
                        }
                        _ => Error::ConnectFailure(format!("{}: {}", address, e)),
                    })
                }
            };
            (data.pending_start.take(), result)
        };

        if let Err(e) = &result {
            debug!(self.log, "connect failed: {}", e);
        }
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

/// A transport connection over a single TCP stream.
pub struct TcpStreamConnection {
    inner: Arc<Inner>,
}

impl TcpStreamConnection {
    pub fn new(connector: Connector, endpoint: Endpoint, log: Logger) -> Self {
        TcpStreamConnection {
            inner: Arc::new(Inner {
                connector,
                endpoint,
                data: Mutex::new(StreamData {
                    state: ConnectionState::Validating,
                    stream: None,
                    pending_start: None,
                    adapter: None,
                }),
                finished: Condvar::new(),
                log,
            }),
        }
    }
}

impl Connection for TcpStreamConnection {
    fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    fn connection_type(&self) -> &str {
        self.inner.endpoint.protocol.as_str()
    }

    fn state(&self) -> ConnectionState {
        self.inner.data_lock().state
    }

    fn start(&self, callback: StartCallback) {
        {
            let mut data = self.inner.data_lock();
            if data.state != ConnectionState::Validating {
                drop(data);
                callback(Err(Error::ConnectionLost(String::from(
                    "connection closed before start",
                ))));
                return;
            }
            data.pending_start = Some(callback);
        }

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.connect());
    }

    fn activate(&self) {
        let mut data = self.inner.data_lock();
        if data.state == ConnectionState::Validating && data.stream.is_some() {
            data.state = ConnectionState::Active;
        }
    }

    fn send_async_request(
        &self,
        request: &Arc<Request>,
        _compress: bool,
    ) -> Result<AsyncStatus, Error> {
        {
            let mut data = self.inner.data_lock();
            let written = match (&data.state, &data.stream) {
                (ConnectionState::Active, Some(stream)) => {
                    let mut writer: &TcpStream = stream;
                    writer.write_all(request.payload())
                }
                (state, _) => {
                    return Err(Error::ConnectionLost(format!(
                        "connection to {} is {}",
                        self.inner.connector, state
                    )))
                }
            };

            if let Err(e) = written {
                warn!(self.inner.log, "write failed: {}", e);
                // The stream is unusable once a write fails.
                if let Some(stream) = data.stream.take() {
                    if let Err(e) = stream.shutdown(Shutdown::Both) {
                        debug!(self.inner.log, "shutdown failed: {}", e);
                    }
                }
                data.state = ConnectionState::Finished;
                self.inner.finished.notify_all();
                return Err(Error::ConnectionLost(format!(
                    "{}: {}",
                    self.inner.connector, e
                )));
            }
        }

        request.complete(Vec::new());
        Ok(AsyncStatus::Sent)
    }

    fn close(&self, reason: Error) {
        let callback = {
            let mut data = self.inner.data_lock();
            if data.state >= ConnectionState::Closing {
                return;
            }
            if let Some(stream) = data.stream.take() {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!(self.inner.log, "shutdown failed: {}", e);
                }
            }
            data.state = ConnectionState::Finished;
            self.inner.finished.notify_all();
            data.pending_start.take()
        };

        debug!(self.inner.log, "closed: {}", reason);

        if let Some(callback) = callback {
            callback(Err(reason));
        }
    }

    fn wait_until_finished(&self) {
        let mut data = self.inner.data_lock();
        while data.state != ConnectionState::Finished {
            data = self
                .inner
                .finished
                .wait(data)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn adapter(&self) -> Option<String> {
        self.inner.data_lock().adapter.clone()
    }

    fn set_adapter(&self, adapter: Option<String>) {
        self.inner.data_lock().adapter = adapter;
    }

    fn info(&self) -> ConnectionInfo {
        let data = self.inner.data_lock();
        let stream = data.stream.as_ref();
        ConnectionInfo {
            connection_type: String::from(self.connection_type()),
            local_address: stream.and_then(|s| s.local_addr().ok()),
            remote_address: stream.and_then(|s| s.peer_addr().ok()),
        }
    }
}
