// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{o, Drain, Logger};

use rebound::connection::{
    Connection, ConnectionInfo, ConnectionState, StartCallback, Transport,
};
use rebound::connection_factory::CreateConnectionCallback;
use rebound::connector::Connector;
use rebound::endpoint::{Endpoint, EndpointSelection};
use rebound::error::Error;
use rebound::request::{AsyncStatus, Request, RequestId};
use rebound::resolver::{EndpointResolver, ResolveCallback};

pub fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint::tcp(host, port)
}

/// Resolves hosts from a fixed table. IP literals resolve to themselves and
/// unknown hosts fail. Optionally completes every resolution on a new
/// thread.
pub struct FakeResolver {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    resolve_count: AtomicUsize,
    asynchronous: bool,
}

impl FakeResolver {
    pub fn new() -> Self {
        FakeResolver {
            hosts: Mutex::new(HashMap::new()),
            resolve_count: AtomicUsize::new(0),
            asynchronous: false,
        }
    }

    pub fn asynchronous() -> Self {
        FakeResolver {
            asynchronous: true,
            ..FakeResolver::new()
        }
    }

    pub fn add_host(&self, host: &str, addresses: Vec<IpAddr>) {
        self.hosts
            .lock()
            .unwrap()
            .insert(String::from(host), addresses);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolve_count.load(Ordering::SeqCst)
    }

    fn lookup(&self, endpoint: &Endpoint) -> Result<Vec<Connector>, Error> {
        let addresses = match endpoint.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => match self.hosts.lock().unwrap().get(&endpoint.host) {
                Some(addresses) => addresses.clone(),
                None => {
                    return Err(Error::ResolutionFailure(format!(
                        "unknown host {}",
                        endpoint.host
                    )))
                }
            },
        };

        Ok(addresses
            .into_iter()
            .map(|ip| {
                Connector::for_endpoint(endpoint, SocketAddr::new(ip, endpoint.port))
            })
            .collect())
    }
}

impl EndpointResolver for FakeResolver {
    fn resolve(
        &self,
        endpoint: &Endpoint,
        _selection: EndpointSelection,
        callback: ResolveCallback,
    ) {
        self.resolve_count.fetch_add(1, Ordering::SeqCst);
        let result = self.lookup(endpoint);
        if self.asynchronous {
            thread::spawn(move || callback(result));
        } else {
            callback(result);
        }
    }
}

/// How the fake transport treats connection attempts to an address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Behavior {
    /// The connect attempt is refused during the handshake.
    Refuse,
    /// The transport cannot even create the connection.
    Unreachable,
    /// The handshake succeeds right away.
    Succeed,
    /// The handshake stays in flight until `FakeTransport::release`.
    Deferred,
}

struct TransportData {
    behaviors: HashMap<SocketAddr, Behavior>,
    attempts: Vec<(SocketAddr, Endpoint)>,
    deferred: Vec<Arc<FakeConnection>>,
    connections: Vec<Arc<FakeConnection>>,
}

pub struct FakeTransport {
    data: Mutex<TransportData>,
    changed: Condvar,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport {
            data: Mutex::new(TransportData {
                behaviors: HashMap::new(),
                attempts: Vec::new(),
                deferred: Vec::new(),
                connections: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn set_behavior(&self, address: SocketAddr, behavior: Behavior) {
        self.data.lock().unwrap().behaviors.insert(address, behavior);
    }

    /// Every connection attempt made so far, in order.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.data
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|a| a.0)
            .collect()
    }

    pub fn attempted_endpoints(&self) -> Vec<Endpoint> {
        self.data
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|a| a.1.clone())
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.data.lock().unwrap().connections.clone()
    }

    /// Block until `count` handshakes to `address` are in flight.
    pub fn wait_for_deferred(&self, address: SocketAddr, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut data = self.data.lock().unwrap();
        while data
            .deferred
            .iter()
            .filter(|c| c.connector.address == address)
            .count()
            < count
        {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for handshake to {}", address);
            data = self.changed.wait_timeout(data, deadline - now).unwrap().0;
        }
    }

    /// Complete the oldest in-flight handshake to `address`.
    pub fn release(&self, address: SocketAddr, result: Result<(), Error>) {
        let connection = {
            let mut data = self.data.lock().unwrap();
            let idx = data
                .deferred
                .iter()
                .position(|c| c.connector.address == address)
                .expect("no deferred handshake for address");
            data.deferred.remove(idx)
        };
        connection.finish_start(result);
    }
}

impl Transport for FakeTransport {
    fn create_connection(
        &self,
        connector: &Connector,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>, Error> {
        let mut data = self.data.lock().unwrap();
        data.attempts.push((connector.address, endpoint.clone()));
        let behavior = data
            .behaviors
            .get(&connector.address)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        if behavior == Behavior::Unreachable {
            return Err(Error::ConnectFailure(format!(
                "no route to {}",
                connector.address
            )));
        }

        let connection = Arc::new(FakeConnection::new(
            connector.clone(),
            endpoint.clone(),
            behavior,
        ));
        if behavior == Behavior::Deferred {
            data.deferred.push(Arc::clone(&connection));
            self.changed.notify_all();
        }
        data.connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

struct ConnectionData {
    state: ConnectionState,
    pending_start: Option<StartCallback>,
    sent: Vec<RequestId>,
    adapter: Option<String>,
    observer_updates: usize,
}

/// An instrumented connection that records the requests sent over it and
/// replies to each with its own payload.
pub struct FakeConnection {
    pub connector: Connector,
    endpoint: Endpoint,
    behavior: Behavior,
    data: Mutex<ConnectionData>,
    finished: Condvar,
}

impl FakeConnection {
    fn new(connector: Connector, endpoint: Endpoint, behavior: Behavior) -> Self {
        FakeConnection {
            connector,
            endpoint,
            behavior,
            data: Mutex::new(ConnectionData {
                state: ConnectionState::Validating,
                pending_start: None,
                sent: Vec::new(),
                adapter: None,
                observer_updates: 0,
            }),
            finished: Condvar::new(),
        }
    }

    /// The ids of the requests sent over this connection, in arrival order.
    pub fn sent(&self) -> Vec<RequestId> {
        self.data.lock().unwrap().sent.clone()
    }

    pub fn observer_updates(&self) -> usize {
        self.data.lock().unwrap().observer_updates
    }

    fn finish_start(&self, result: Result<(), Error>) {
        let callback = {
            let mut data = self.data.lock().unwrap();
            if result.is_err() {
                data.state = ConnectionState::Finished;
                self.finished.notify_all();
            }
            data.pending_start.take()
        };
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

impl Connection for FakeConnection {
    fn connector(&self) -> &Connector {
        &self.connector
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connection_type(&self) -> &str {
        "fake"
    }

    fn state(&self) -> ConnectionState {
        self.data.lock().unwrap().state
    }

    fn start(&self, callback: StartCallback) {
        self.data.lock().unwrap().pending_start = Some(callback);
        match self.behavior {
            Behavior::Succeed => self.finish_start(Ok(())),
            Behavior::Refuse => self.finish_start(Err(Error::ConnectFailure(
                format!("connection refused by {}", self.connector.address),
            ))),
            Behavior::Deferred | Behavior::Unreachable => (),
        }
    }

    fn activate(&self) {
        let mut data = self.data.lock().unwrap();
        if data.state == ConnectionState::Validating {
            data.state = ConnectionState::Active;
        }
    }

    fn send_async_request(
        &self,
        request: &Arc<Request>,
        _compress: bool,
    ) -> Result<AsyncStatus, Error> {
        {
            let mut data = self.data.lock().unwrap();
            if data.state != ConnectionState::Active {
                return Err(Error::ConnectionLost(format!(
                    "connection to {} is {}",
                    self.connector.address, data.state
                )));
            }
            data.sent.push(request.id());
        }
        request.complete(request.payload().to_vec());
        Ok(AsyncStatus::Sent)
    }

    fn close(&self, reason: Error) {
        let callback = {
            let mut data = self.data.lock().unwrap();
            data.state = ConnectionState::Finished;
            self.finished.notify_all();
            data.pending_start.take()
        };
        if let Some(callback) = callback {
            callback(Err(reason));
        }
    }

    fn wait_until_finished(&self) {
        let mut data = self.data.lock().unwrap();
        while data.state != ConnectionState::Finished {
            data = self.finished.wait(data).unwrap();
        }
    }

    fn adapter(&self) -> Option<String> {
        self.data.lock().unwrap().adapter.clone()
    }

    fn set_adapter(&self, adapter: Option<String>) {
        self.data.lock().unwrap().adapter = adapter;
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_type: String::from("fake"),
            local_address: None,
            remote_address: Some(self.connector.address),
        }
    }

    fn update_observer(&self) {
        self.data.lock().unwrap().observer_updates += 1;
    }
}

/// The outcome delivered to a `RecordingCallback`.
pub type Outcome = Result<(Arc<dyn Connection>, bool), Error>;

/// Records every notification delivered by the connection factory.
pub struct RecordingCallback {
    outcomes: Mutex<Vec<Outcome>>,
    changed: Condvar,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingCallback {
            outcomes: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        })
    }

    /// Block until the first notification arrives.
    pub fn wait(&self) -> Outcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut outcomes = self.outcomes.lock().unwrap();
        while outcomes.is_empty() {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for connection outcome");
            outcomes = self.changed.wait_timeout(outcomes, deadline - now).unwrap().0;
        }
        outcomes[0].clone()
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        match self.wait() {
            Ok((connection, _)) => connection,
            Err(e) => panic!("expected a connection, got {}", e),
        }
    }

    pub fn error(&self) -> Error {
        match self.wait() {
            Ok((connection, _)) => {
                panic!("expected a failure, got {}", connection.connector())
            }
            Err(e) => e,
        }
    }

    pub fn is_notified(&self) -> bool {
        !self.outcomes.lock().unwrap().is_empty()
    }

    pub fn notifications(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }
}

impl CreateConnectionCallback for RecordingCallback {
    fn set_connection(&self, connection: Arc<dyn Connection>, compress: bool) {
        self.outcomes.lock().unwrap().push(Ok((connection, compress)));
        self.changed.notify_all();
    }

    fn set_exception(&self, error: Error) {
        self.outcomes.lock().unwrap().push(Err(error));
        self.changed.notify_all();
    }
}
