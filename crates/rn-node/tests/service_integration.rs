//! Service integration tests

mod common;

use std::time::Duration;

use rn_core::msgs::{AddTwoInts, AddTwoIntsRequest, AddTwoIntsResponse};
use rn_core::{RosService, ServiceCallError};
use rn_protocol::ProtocolError;

use common::{registry, start_node, wait_until};

/// Same name and payloads as `AddTwoInts`, different schema
struct AddTwoFloats;

impl RosService for AddTwoFloats {
    type Request = AddTwoIntsRequest;
    type Response = AddTwoIntsResponse;

    fn type_name() -> &'static str {
        "test_srvs/AddTwoFloats"
    }

    fn md5sum() -> &'static str {
        "00000000000000000000000000000000"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_round_trip() {
    let registry = registry();
    let server = start_node("server", &registry).await;
    let client_node = start_node("client", &registry).await;

    let _service = server
        .advertise_service::<AddTwoInts, _>("add_two_ints", |req: AddTwoIntsRequest| {
            Ok(AddTwoIntsResponse { sum: req.a + req.b })
        })
        .unwrap();
    wait_until("service registration", || registry.has_service("/add_two_ints")).await;

    let client = client_node
        .service_client::<AddTwoInts>("add_two_ints")
        .unwrap();
    let response = client.call(AddTwoIntsRequest { a: 2, b: 40 }).await.unwrap();
    assert_eq!(response.sum, 42);

    // Each call opens its own connection
    let response = client.call(AddTwoIntsRequest { a: -1, b: 1 }).await.unwrap();
    assert_eq!(response.sum, 0);

    server.shutdown().await;
    client_node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_failure_is_reported_to_caller() {
    let registry = registry();
    let server = start_node("server", &registry).await;

    let _service = server
        .advertise_service::<AddTwoInts, _>("checked_add", |req: AddTwoIntsRequest| {
            let sum = req
                .a
                .checked_add(req.b)
                .ok_or_else(|| anyhow::anyhow!("overflow adding {} and {}", req.a, req.b))?;
            Ok(AddTwoIntsResponse { sum })
        })
        .unwrap();
    wait_until("service registration", || registry.has_service("/checked_add")).await;

    let client = server.service_client::<AddTwoInts>("checked_add").unwrap();
    match client.call(AddTwoIntsRequest { a: i64::MAX, b: 1 }).await {
        Err(ServiceCallError::Remote(message)) => assert!(message.contains("overflow")),
        other => panic!("expected a remote failure, got {:?}", other.map(|r| r.sum)),
    }

    // The provider keeps serving after a failed call
    let response = client.call(AddTwoIntsRequest { a: 1, b: 1 }).await.unwrap();
    assert_eq!(response.sum, 2);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_handler_is_reported_to_caller() {
    let registry = registry();
    let server = start_node("server", &registry).await;

    let _service = server
        .advertise_service::<AddTwoInts, _>("fragile", |req: AddTwoIntsRequest| {
            if req.b == 0 {
                panic!("division by zero");
            }
            Ok(AddTwoIntsResponse { sum: req.a / req.b })
        })
        .unwrap();
    wait_until("service registration", || registry.has_service("/fragile")).await;

    let client = server.service_client::<AddTwoInts>("fragile").unwrap();
    assert!(matches!(
        client.call(AddTwoIntsRequest { a: 1, b: 0 }).await,
        Err(ServiceCallError::Remote(_))
    ));

    let response = client.call(AddTwoIntsRequest { a: 9, b: 3 }).await.unwrap();
    assert_eq!(response.sum, 3);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_probe_does_not_invoke_handler() {
    let registry = registry();
    let server = start_node("server", &registry).await;

    let _service = server
        .advertise_service::<AddTwoInts, _>("guarded", |_req: AddTwoIntsRequest| {
            Err(anyhow::anyhow!("handler must not run for a probe"))
        })
        .unwrap();
    wait_until("service registration", || registry.has_service("/guarded")).await;

    let client = server.service_client::<AddTwoInts>("guarded").unwrap();
    let reply = client.probe().await.unwrap();
    assert_eq!(reply.md5sum(), Some(AddTwoInts::md5sum()));
    assert_eq!(reply.caller_id(), Some("/server"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_service_fails_lookup() {
    let registry = registry();
    let node = start_node("client", &registry).await;

    let client = node.service_client::<AddTwoInts>("nobody_home").unwrap();
    let result = client.call(AddTwoIntsRequest { a: 1, b: 2 }).await;
    assert!(matches!(result, Err(ServiceCallError::Lookup(_))));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schema_mismatch_is_rejected() {
    let registry = registry();
    let server = start_node("server", &registry).await;

    let _service = server
        .advertise_service::<AddTwoInts, _>("add", |req: AddTwoIntsRequest| {
            Ok(AddTwoIntsResponse { sum: req.a + req.b })
        })
        .unwrap();
    wait_until("service registration", || registry.has_service("/add")).await;

    let client = server.service_client::<AddTwoFloats>("add").unwrap();
    let result = client.call(AddTwoIntsRequest { a: 1, b: 2 }).await;
    assert!(matches!(
        result,
        Err(ServiceCallError::Protocol(ProtocolError::PeerRejected(_)))
    ));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unadvertised_service_is_gone() {
    let registry = registry();
    let server = start_node("server", &registry).await;

    let _service = server
        .advertise_service::<AddTwoInts, _>("temporary", |req: AddTwoIntsRequest| {
            Ok(AddTwoIntsResponse { sum: req.a + req.b })
        })
        .unwrap();
    wait_until("service registration", || registry.has_service("/temporary")).await;

    assert!(server.unadvertise_service("temporary").await.unwrap());
    assert!(!registry.has_service("/temporary"));
    assert!(!server.unadvertise_service("temporary").await.unwrap());

    let client = server.service_client::<AddTwoInts>("temporary").unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.call(AddTwoIntsRequest { a: 1, b: 2 }),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(ServiceCallError::Lookup(_))));

    client.shutdown();
    assert!(matches!(
        client.call(AddTwoIntsRequest { a: 1, b: 2 }).await,
        Err(ServiceCallError::Shutdown)
    ));

    server.shutdown().await;
}
