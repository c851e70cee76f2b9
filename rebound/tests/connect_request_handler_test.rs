// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rebound::connect_request_handler::{ConnectRequestHandler, HandlerStatus};
use rebound::connection::same_connection;
use rebound::connection::Connection;
use rebound::connection_factory::types::ConnectionFactoryOptions;
use rebound::endpoint::EndpointSelection;
use rebound::error::Error;
use rebound::reference::Reference;
use rebound::request::{AsyncStatus, Request};
use rebound::request_handler::same_handler;
use rebound::runtime::Runtime;

use common::{addr, endpoint, test_log, Behavior, FakeResolver, FakeTransport};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn new_runtime() -> (Runtime, Arc<FakeTransport>) {
    let resolver = Arc::new(FakeResolver::new());
    let transport = Arc::new(FakeTransport::new());
    let runtime = Runtime::new(
        ConnectionFactoryOptions {
            log: Some(test_log()),
            ..Default::default()
        },
        resolver,
        transport.clone(),
    );
    (runtime, transport)
}

#[test]
fn connect_request_handler_fifo_drain() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5000), Behavior::Deferred);

    let proxy = runtime
        .string_to_proxy("hello:tcp -h 127.0.0.1 -p 5000")
        .unwrap();

    let requests: Vec<Arc<Request>> =
        (0..5u8).map(|i| Request::new("echo", vec![i])).collect();
    for request in &requests {
        assert_eq!(proxy.invoke(request).unwrap(), AsyncStatus::Queued);
    }

    transport.wait_for_deferred(addr(5000), 1);
    let handler = runtime
        .request_handler_factory()
        .registered_handler(proxy.reference())
        .unwrap();
    assert_eq!(handler.state(), HandlerStatus::Connecting);
    assert_eq!(handler.queued_requests(), 5);

    transport.release(addr(5000), Ok(()));

    for (i, request) in requests.iter().enumerate() {
        assert_eq!(request.wait(WAIT).unwrap(), vec![i as u8]);
    }
    let ids: Vec<_> = requests.iter().map(|r| r.id()).collect();
    assert_eq!(transport.connections()[0].sent(), ids);

    assert_eq!(handler.state(), HandlerStatus::Initialized);
    assert_eq!(handler.queued_requests(), 0);
    assert!(runtime
        .request_handler_factory()
        .registered_handler(proxy.reference())
        .is_none());

    // The proxy now bypasses the connect request handler.
    let direct = proxy.request_handler();
    assert!(!same_handler(&*direct, &*handler));

    let request = Request::new("echo", vec![9]);
    assert_eq!(proxy.invoke(&request).unwrap(), AsyncStatus::Sent);
    assert_eq!(request.wait(WAIT).unwrap(), vec![9]);
    assert_eq!(transport.attempts().len(), 1);

    let connection = handler.wait_for_connection(WAIT).unwrap();
    assert!(same_connection(&connection, &proxy.connection().unwrap().unwrap()));
}

#[test]
fn connect_request_handler_fails_queue_in_order() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5010), Behavior::Deferred);

    let proxy = runtime
        .string_to_proxy("hello:tcp -h 127.0.0.1 -p 5010")
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let requests: Vec<Arc<Request>> = (0..4usize)
        .map(|i| {
            let order = order.clone();
            Request::with_callback("echo", Vec::new(), move |result| {
                assert!(result.is_err());
                order.lock().unwrap().push(i);
            })
        })
        .collect();
    for request in &requests {
        assert_eq!(proxy.invoke(request).unwrap(), AsyncStatus::Queued);
    }

    transport.wait_for_deferred(addr(5010), 1);
    let handler = runtime
        .request_handler_factory()
        .registered_handler(proxy.reference())
        .unwrap();

    transport.release(
        addr(5010),
        Err(Error::ConnectTimeout(String::from("127.0.0.1:5010"))),
    );

    for request in &requests {
        match request.wait(WAIT) {
            Err(Error::ConnectTimeout(_)) => (),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(handler.state(), HandlerStatus::Failed);
    match handler.wait_for_connection(WAIT) {
        Err(Error::ConnectTimeout(_)) => (),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("connection after failure"),
    }

    // The failed handler is gone; the next request starts a fresh attempt.
    assert!(runtime
        .request_handler_factory()
        .registered_handler(proxy.reference())
        .is_none());
    transport.set_behavior(addr(5010), Behavior::Succeed);

    let request = Request::new("echo", vec![1]);
    assert_eq!(proxy.invoke(&request).unwrap(), AsyncStatus::Sent);
    assert_eq!(request.wait(WAIT).unwrap(), vec![1]);
    assert_eq!(transport.attempts().len(), 2);
}

#[test]
fn connect_request_handler_cancel_queued_request() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5020), Behavior::Deferred);

    let proxy = runtime
        .string_to_proxy("hello:tcp -h 127.0.0.1 -p 5020")
        .unwrap();

    let requests: Vec<Arc<Request>> =
        (0..3u8).map(|i| Request::new("echo", vec![i])).collect();
    for request in &requests {
        proxy.invoke(request).unwrap();
    }
    transport.wait_for_deferred(addr(5020), 1);

    proxy.cancel(&requests[1]);
    match requests[1].wait(WAIT) {
        Err(Error::InvocationCanceled) => (),
        other => panic!("unexpected outcome {:?}", other),
    }

    // The shared attempt carries on for the others.
    assert!(!requests[0].is_done());
    transport.release(addr(5020), Ok(()));

    assert_eq!(requests[0].wait(WAIT).unwrap(), vec![0]);
    assert_eq!(requests[2].wait(WAIT).unwrap(), vec![2]);
    assert_eq!(
        transport.connections()[0].sent(),
        vec![requests[0].id(), requests[2].id()]
    );
    assert_eq!(transport.attempts().len(), 1);
}

#[test]
fn connect_request_handler_shared_across_proxies() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5030), Behavior::Deferred);

    let reference = Reference::new("hello", vec![endpoint("127.0.0.1", 5030)]);
    let first = runtime.proxy(reference.clone());
    let second = runtime.proxy(reference.clone());

    let a = Request::new("echo", vec![1]);
    let b = Request::new("echo", vec![2]);
    assert_eq!(first.invoke(&a).unwrap(), AsyncStatus::Queued);
    assert_eq!(second.invoke(&b).unwrap(), AsyncStatus::Queued);

    transport.wait_for_deferred(addr(5030), 1);
    let handler = runtime
        .request_handler_factory()
        .registered_handler(&reference)
        .unwrap();
    assert!(same_handler(&*first.request_handler(), &*handler));
    assert!(same_handler(&*second.request_handler(), &*handler));
    assert_eq!(handler.queued_requests(), 2);

    transport.release(addr(5030), Ok(()));
    a.wait(WAIT).unwrap();
    b.wait(WAIT).unwrap();

    assert_eq!(transport.attempts().len(), 1);
    assert_eq!(transport.connections()[0].sent(), vec![a.id(), b.id()]);

    let c1 = first.connection().unwrap().unwrap();
    let c2 = second.connection().unwrap().unwrap();
    assert!(same_connection(&c1, &c2));
}

#[test]
fn connect_request_handler_connect_is_idempotent() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5040), Behavior::Deferred);

    let reference = Reference::new("hello", vec![endpoint("127.0.0.1", 5040)]);
    let handler = ConnectRequestHandler::new(
        reference,
        runtime.connection_factory().clone(),
        Arc::downgrade(runtime.request_handler_factory()),
        &test_log(),
    );
    assert_eq!(handler.state(), HandlerStatus::Unconnected);

    handler.clone().connect(None);
    handler.clone().connect(None);
    transport.wait_for_deferred(addr(5040), 1);
    assert_eq!(handler.state(), HandlerStatus::Connecting);

    match handler.wait_for_connection(Some(Duration::from_millis(50))) {
        Err(Error::InvocationTimeout) => (),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("connection before handshake"),
    }

    transport.release(addr(5040), Ok(()));
    let connection = handler.wait_for_connection(WAIT).unwrap();
    assert_eq!(connection.connector().address, addr(5040));
    assert_eq!(handler.state(), HandlerStatus::Initialized);
    assert_eq!(transport.attempts().len(), 1);
}

#[test]
fn connect_request_handler_immediate_failure() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5050), Behavior::Refuse);

    let proxy = runtime
        .string_to_proxy("hello:tcp -h 127.0.0.1 -p 5050")
        .unwrap();

    let request = Request::new("echo", Vec::new());
    match proxy.invoke(&request) {
        Err(Error::ConnectFailure(_)) => (),
        other => panic!("unexpected result {:?}", other),
    }
    match request.outcome() {
        Some(Err(Error::ConnectFailure(_))) => (),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn connect_request_handler_uncached_tries_endpoints_in_turn() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5060), Behavior::Refuse);

    let reference = Reference::new(
        "hello",
        vec![endpoint("127.0.0.1", 5060), endpoint("127.0.0.1", 5061)],
    )
    .with_cache_connection(false)
    .with_endpoint_selection(EndpointSelection::Ordered);
    let proxy = runtime.proxy(reference.clone());

    let request = Request::new("echo", vec![7]);
    assert_eq!(proxy.invoke(&request).unwrap(), AsyncStatus::Sent);
    assert_eq!(request.wait(WAIT).unwrap(), vec![7]);

    assert_eq!(transport.attempts(), vec![addr(5060), addr(5061)]);
    assert!(runtime
        .request_handler_factory()
        .registered_handler(&reference)
        .is_none());

    // A later request starts over at the first endpoint and reuses the
    // pooled connection to the second.
    let request = Request::new("echo", vec![8]);
    proxy.invoke(&request).unwrap();
    assert_eq!(request.wait(WAIT).unwrap(), vec![8]);
    assert_eq!(
        transport.attempts(),
        vec![addr(5060), addr(5061), addr(5060)]
    );
}

#[test]
fn connect_request_handler_uncached_reports_last_failure() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5070), Behavior::Unreachable);
    transport.set_behavior(addr(5071), Behavior::Refuse);

    let reference = Reference::new(
        "hello",
        vec![endpoint("127.0.0.1", 5070), endpoint("127.0.0.1", 5071)],
    )
    .with_cache_connection(false)
    .with_endpoint_selection(EndpointSelection::Ordered);
    let proxy = runtime.proxy(reference);

    let request = Request::new("echo", Vec::new());
    match proxy.invoke(&request) {
        Err(Error::ConnectFailure(msg)) => {
            assert!(msg.contains("refused by 127.0.0.1:5071"), "{}", msg)
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn connect_request_handler_destroy_fails_queue() {
    let (runtime, transport) = new_runtime();
    transport.set_behavior(addr(5080), Behavior::Deferred);

    let proxy = runtime
        .string_to_proxy("hello:tcp -h 127.0.0.1 -p 5080")
        .unwrap();
    let request = Request::new("echo", Vec::new());
    assert_eq!(proxy.invoke(&request).unwrap(), AsyncStatus::Queued);
    transport.wait_for_deferred(addr(5080), 1);

    runtime.destroy();

    match request.wait(WAIT) {
        Err(Error::FactoryDestroyed) => (),
        other => panic!("unexpected outcome {:?}", other),
    }
}
