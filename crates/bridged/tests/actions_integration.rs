//! Integration tests for remote actions and snapshot capture against a
//! fake peer with several execution contexts.

mod support;

use std::time::Duration;

use bridged::invoker::{self, InvokeError};
use bridged::poller::{CaptureOutcome, Poller};
use bridged::transport::{self, TransportHandle, TransportOptions};
use serde_json::json;
use support::{
    evaluate_by_context, exception, undefined, value, wait_until, within, FakePeer, PeerConfig,
    Reply,
};

async fn connected(peer: &FakePeer, contexts: usize) -> TransportHandle {
    let handle = transport::open(&peer.ws_url, TransportOptions::default())
        .await
        .unwrap();
    handle.enable_runtime().await.unwrap();
    wait_until(|| handle.contexts().len() == contexts).await;
    handle
}

fn poller() -> Poller {
    Poller::new(
        "capture()",
        Duration::from_millis(50),
        Duration::from_millis(10),
        Duration::from_secs(10),
    )
}

// ============================================================================
// Invoker
// ============================================================================

#[tokio::test]
async fn test_invoke_skips_failing_context() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![1, 2, 3],
        responder: evaluate_by_context(|ctx, _| match ctx {
            1 => exception("TypeError: button is null"),
            2 => value(json!("clicked")),
            _ => value(json!("never reached")),
        }),
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 3).await;

    let result = invoker::invoke(&handle, "click()").await.unwrap();
    assert_eq!(result, json!("clicked"));

    let contexts_tried: Vec<i64> = peer
        .requests()
        .iter()
        .filter(|r| r["method"] == "Runtime.evaluate")
        .map(|r| r["params"]["contextId"].as_i64().unwrap())
        .collect();
    assert_eq!(contexts_tried, vec![1, 2]);

    let sent = &peer.requests()[1];
    assert_eq!(sent["params"]["expression"], "click()");
    assert_eq!(sent["params"]["awaitPromise"], true);
}

#[tokio::test]
async fn test_invoke_reports_last_failure() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![1, 2],
        responder: evaluate_by_context(|ctx, _| match ctx {
            1 => undefined(),
            _ => exception("Error: not here"),
        }),
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 2).await;

    let err = invoker::invoke(&handle, "click()").await.unwrap_err();
    match err {
        InvokeError::NoContext {
            reason: Some(reason),
        } => assert!(reason.contains("not here"), "got {reason}"),
        other => panic!("expected NoContext with a reason, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invoke_without_contexts() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![],
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 0).await;

    let err = invoker::invoke(&handle, "click()").await.unwrap_err();
    assert!(matches!(err, InvokeError::NoContext { reason: None }));
    assert_eq!(err.reason(), "no_context");
}

#[tokio::test]
async fn test_invoke_aborts_when_connection_closes() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![1, 2],
        responder: support::responder(|_, _| Reply::Silent),
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 2).await;

    let invoking = handle.clone();
    let action = tokio::spawn(async move { invoker::invoke(&invoking, "click()").await });
    wait_until(|| peer.requests().len() == 2).await;

    peer.drop_connections();

    let err = within(action).await.unwrap().unwrap_err();
    assert!(matches!(err, InvokeError::Closed));
    assert_eq!(err.reason(), "closed");

    // Only the first context was tried
    assert_eq!(peer.requests().len(), 2);
}

#[tokio::test]
async fn test_invoke_after_close() {
    let peer = FakePeer::start(PeerConfig::default()).await;
    let handle = connected(&peer, 1).await;

    handle.close();
    wait_until(|| handle.contexts().is_empty()).await;

    let err = invoker::invoke(&handle, "click()").await.unwrap_err();
    assert!(matches!(err, InvokeError::NoContext { reason: None }));
}

// ============================================================================
// Capture
// ============================================================================

#[tokio::test]
async fn test_capture_uses_first_usable_context() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![1, 2],
        responder: evaluate_by_context(|ctx, _| match ctx {
            1 => value(json!({ "error": "container not found" })),
            _ => value(json!({
                "content": "<div>hello</div>",
                "style": ".a{}",
                "scrollMetrics": { "scrollTop": 0 },
                "stats": { "nodes": 1 }
            })),
        }),
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 2).await;

    match poller().capture(&handle).await {
        CaptureOutcome::Captured(state) => {
            assert_eq!(state.content, "<div>hello</div>");
            assert_eq!(state.style, ".a{}");
            assert_eq!(state.stats["nodes"], 1);
        }
        other => panic!("expected capture, got {other:?}"),
    }
}

#[tokio::test]
async fn test_capture_keeps_first_failure() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![4, 5],
        responder: evaluate_by_context(|ctx, _| match ctx {
            4 => value(json!({ "error": "container not found" })),
            _ => exception("ReferenceError: capture is not defined"),
        }),
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 2).await;

    match poller().capture(&handle).await {
        CaptureOutcome::Failed(reason) => {
            assert!(reason.contains("context 4"), "got {reason}");
            assert!(reason.contains("container not found"), "got {reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_capture_without_contexts() {
    let peer = FakePeer::start(PeerConfig {
        contexts: vec![],
        ..Default::default()
    })
    .await;
    let handle = connected(&peer, 0).await;

    assert!(matches!(
        poller().capture(&handle).await,
        CaptureOutcome::NoContext
    ));
}
