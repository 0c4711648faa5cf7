//! End-to-end request lifetime scenarios.
//!
//! Each test hosts a handler in a `TestServer`, drives it with a
//! `TestClient`, and checks what both ends observe when the handler aborts
//! (or does not abort) at a chosen point.

use bytes::Bytes;
use http::StatusCode;
use request_lifetime::driver::{SyncPoint, TimeoutExt};
use request_lifetime::{
    AbortStage, ClientState, CloseOutcome, CompletionMode, HandlerResult, HarnessError, Outcome,
    RequestContext, TestServer, ABORT_MESSAGE,
};
use tokio::sync::mpsc;

/// Abort before anything is written: the registered callback fires and the
/// client fails while awaiting headers.
#[tokio::test]
async fn test_abort_triggers_request_aborted_signal() {
    let request_aborted = SyncPoint::new();
    let point = request_aborted.clone();

    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let point = point.clone();
            async move {
                let fired = point.clone();
                ctx.request_aborted().register(move || {
                    fired.set();
                });
                ctx.abort();

                point.wait().default_timeout().await?;
                Ok(())
            }
        })
        .build()
        .unwrap();

    let err = server
        .client()
        .get("/")
        .completion(CompletionMode::HeadersRead)
        .send()
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), ABORT_MESSAGE);
    assert_eq!(
        err.request_aborted().map(|a| a.stage()),
        Some(AbortStage::BeforeHeaders)
    );
    request_aborted.wait().default_timeout().await.unwrap();
}

/// Abort before headers: the client fails even though the handler keeps
/// going and tries to write afterwards; that write fails locally.
#[tokio::test]
async fn test_abort_before_headers_sent_client_throws() {
    let abort_received = SyncPoint::new();
    let point = abort_received.clone();
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let point = point.clone();
            let result_tx = result_tx.clone();
            async move {
                ctx.abort();
                point.wait().default_timeout().await?;

                let write = ctx.write("too late").await;
                let _ = result_tx.send((write, ctx.request_aborted().is_cancelled()));
                Ok(())
            }
        })
        .build()
        .unwrap();

    let err = server
        .client()
        .get("/")
        .completion(CompletionMode::HeadersRead)
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), ABORT_MESSAGE);
    assert!(matches!(err, HarnessError::Aborted(_)));
    abort_received.set();

    let (write, cancelled) = result_rx.recv().default_timeout().await.unwrap().unwrap();
    assert!(matches!(write, Err(HarnessError::StreamClosed)));
    assert!(cancelled);
}

/// Headers flushed, then abort: headers read fine, the body read fails.
#[tokio::test]
async fn test_abort_after_headers_sent_client_body_throws() {
    let response_received = SyncPoint::new();
    let abort_received = SyncPoint::new();
    let (response_point, abort_point) = (response_received.clone(), abort_received.clone());

    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let response_point = response_point.clone();
            let abort_point = abort_point.clone();
            async move {
                ctx.flush_headers().await?;
                response_point.wait().default_timeout().await?;
                ctx.abort();
                abort_point.wait().default_timeout().await?;
                Ok(())
            }
        })
        .build()
        .unwrap();

    let response = server
        .client()
        .get("/")
        .completion(CompletionMode::HeadersRead)
        .send()
        .await
        .unwrap();
    response_received.set();

    let response = response.error_for_status().unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let err = response.bytes().default_timeout().await.unwrap().unwrap_err();
    assert!(matches!(err, HarnessError::BodyRead(_)));
    assert_eq!(err.root_message(), ABORT_MESSAGE);
    assert_eq!(
        err.request_aborted().map(|a| a.stage()),
        Some(AbortStage::DuringBody)
    );
    abort_received.set();
}

/// Partial body, then abort: the written bytes arrive, the next read fails.
#[tokio::test]
async fn test_abort_after_some_data_sent_client_body_throws() {
    let response_received = SyncPoint::new();
    let abort_received = SyncPoint::new();
    let (response_point, abort_point) = (response_received.clone(), abort_received.clone());

    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let response_point = response_point.clone();
            let abort_point = abort_point.clone();
            async move {
                ctx.write("Hello World").await?;
                response_point.wait().default_timeout().await?;
                ctx.abort();
                abort_point.wait().default_timeout().await?;
                Ok(())
            }
        })
        .build()
        .unwrap();

    let response = server
        .client()
        .get("/")
        .completion(CompletionMode::HeadersRead)
        .send()
        .await
        .unwrap();
    response_received.set();

    let mut response = response.error_for_status().unwrap();
    let chunk = response.chunk().default_timeout().await.unwrap().unwrap();
    assert_eq!(chunk, Some(Bytes::from_static(b"Hello World")));

    let err = response.chunk().default_timeout().await.unwrap().unwrap_err();
    assert_eq!(err.root_message(), ABORT_MESSAGE);
    assert_eq!(response.state(), ClientState::AbortedMidBody);
    assert_eq!(response.outcome(), Some(Outcome::AbortedDuringBody));
    abort_received.set();
}

/// Full body buffering surfaces a mid-body abort from `send` itself.
#[tokio::test]
async fn test_content_read_mode_reports_mid_body_abort() {
    let server = TestServer::builder()
        .handler(|ctx: RequestContext| async move {
            ctx.write("Hello World").await?;
            ctx.abort();
            Ok(())
        })
        .build()
        .unwrap();

    let err = server.client().get("/").send().await.unwrap_err();
    assert!(matches!(err, HarnessError::BodyRead(_)));
    assert_eq!(err.root_message(), ABORT_MESSAGE);
    assert_eq!(err.request_aborted().map(|a| a.bytes_received()), Some(11));
}

/// Aborting twice is observably identical to aborting once.
#[tokio::test]
async fn test_abort_is_idempotent() {
    for aborts in [1usize, 2] {
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let server = TestServer::builder()
            .handler(move |ctx: RequestContext| {
                let outcome_tx = outcome_tx.clone();
                async move {
                    ctx.write("Hello World").await?;
                    let outcomes: Vec<_> = (0..aborts).map(|_| ctx.abort()).collect();
                    let _ = outcome_tx.send(outcomes);
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let mut response = server
            .client()
            .get("/")
            .completion(CompletionMode::HeadersRead)
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.chunk().await.unwrap(),
            Some(Bytes::from_static(b"Hello World"))
        );
        let err = response.chunk().await.unwrap_err();
        assert_eq!(err.root_message(), ABORT_MESSAGE);

        let outcomes = outcome_rx.recv().default_timeout().await.unwrap().unwrap();
        assert!(matches!(outcomes[0], CloseOutcome::Truncated { .. }));
        assert!(outcomes[1..]
            .iter()
            .all(|outcome| *outcome == CloseOutcome::AlreadyAborted));
    }
}

/// Without an abort every write sequence completes cleanly.
#[tokio::test]
async fn test_no_abort_completes_for_any_write_sequence() {
    let sequences: Vec<Vec<&'static str>> = vec![
        vec![],
        vec![""],
        vec!["Hello World"],
        vec!["Hello", "", " ", "World"],
    ];

    for (index, sequence) in sequences.into_iter().enumerate() {
        let flush_first = index % 2 == 0;
        let writes = sequence.clone();
        let server = TestServer::builder()
            .handler(move |ctx: RequestContext| {
                let writes = writes.clone();
                async move {
                    if flush_first {
                        ctx.flush_headers().await?;
                    }
                    for chunk in writes {
                        ctx.write(chunk).await?;
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let mut response = server.client().get("/").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.outcome(), Some(Outcome::Success));

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, sequence.concat().into_bytes());
    }
}

/// Abort after the response completed changes nothing for the client.
#[tokio::test]
async fn test_abort_after_complete_is_noop() {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let outcome_tx = outcome_tx.clone();
            async move {
                ctx.write("done").await?;
                ctx.complete()?;
                let outcome = ctx.abort();
                let _ = outcome_tx.send((outcome, ctx.request_aborted().is_cancelled()));
                Ok(())
            }
        })
        .build()
        .unwrap();

    let response = server.client().get("/").send().await.unwrap();
    assert_eq!(response.outcome(), Some(Outcome::Success));
    assert_eq!(response.text().await.unwrap(), "done");

    let (outcome, cancelled) = outcome_rx.recv().default_timeout().await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::AlreadyComplete);
    assert!(cancelled);
}

/// A handler failure before the response started becomes a 500.
#[tokio::test]
async fn test_handler_error_before_start_is_500() {
    let server = TestServer::builder()
        .handler(|_ctx: RequestContext| async move {
            Err(HarnessError::ChannelMisuse("handler gave up"))
        })
        .build()
        .unwrap();

    let response = server.client().get("/").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(matches!(
        response.error_for_status(),
        Err(HarnessError::Status(StatusCode::INTERNAL_SERVER_ERROR))
    ));
}

#[tokio::test]
async fn test_debug_build_reports_handler_error() {
    let server = TestServer::builder()
        .debug_build(true)
        .handler(|_ctx: RequestContext| async move {
            Err(HarnessError::ChannelMisuse("handler gave up"))
        })
        .build()
        .unwrap();

    let response = server.client().get("/").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.text().await.unwrap(),
        "Channel misuse: handler gave up"
    );
}

async fn exploding_handler(_ctx: RequestContext) -> HandlerResult {
    panic!("handler exploded")
}

#[tokio::test]
async fn test_handler_panic_is_500() {
    let server = TestServer::builder()
        .handler(exploding_handler)
        .build()
        .unwrap();

    let response = server.client().get("/").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

/// A panicking abort observer neither hides the abort from the client nor
/// keeps later observers from running.
#[tokio::test]
async fn test_panicking_abort_observer_still_aborts() {
    let second_fired = SyncPoint::new();
    let point = second_fired.clone();

    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let point = point.clone();
            async move {
                ctx.request_aborted().register(|| panic!("observer failed"));
                ctx.request_aborted().register(move || {
                    point.set();
                });
                ctx.abort();
                Ok(())
            }
        })
        .build()
        .unwrap();

    let err = server
        .client()
        .get("/")
        .completion(CompletionMode::HeadersRead)
        .send()
        .default_timeout()
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, HarnessError::Aborted(_)));
    assert_eq!(err.to_string(), ABORT_MESSAGE);

    second_fired.wait().default_timeout().await.unwrap();
}

/// A handler failure after the response started truncates the body.
#[tokio::test]
async fn test_handler_error_after_start_truncates() {
    let aborted = SyncPoint::new();
    let point = aborted.clone();

    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let point = point.clone();
            async move {
                let fired = point.clone();
                ctx.request_aborted().register(move || {
                    fired.set();
                });
                ctx.write("partial").await?;
                Err(HarnessError::ChannelMisuse("handler gave up"))
            }
        })
        .build()
        .unwrap();

    let mut response = server
        .client()
        .get("/")
        .completion(CompletionMode::HeadersRead)
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.chunk().await.unwrap(),
        Some(Bytes::from_static(b"partial"))
    );
    let err = response.chunk().await.unwrap_err();
    assert_eq!(err.root_message(), ABORT_MESSAGE);
    aborted.wait().default_timeout().await.unwrap();
}

#[tokio::test]
async fn test_json_echo() {
    let server = TestServer::builder()
        .request_body_chunk_size(4)
        .handler(|ctx: RequestContext| async move {
            let body = ctx.read_body().await?;
            let value: serde_json::Value = serde_json::from_slice(&body)?;
            ctx.set_status(StatusCode::CREATED)?;
            ctx.write_json(&value).await
        })
        .build()
        .unwrap();

    let payload = serde_json::json!({ "name": "lifetime", "items": [1, 2, 3] });
    let response = server
        .client()
        .post("/echo")
        .json(&payload)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers()[http::header::CONTENT_TYPE],
        "application/json"
    );
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_request_head_reaches_handler() {
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    let server = TestServer::builder()
        .handler(move |ctx: RequestContext| {
            let head_tx = head_tx.clone();
            async move {
                let _ = head_tx.send(ctx.request().clone());
                Ok(())
            }
        })
        .build()
        .unwrap();

    server
        .client()
        .request(http::Method::PUT, "/items/7?verbose=1")
        .header("x-trace", "abc")
        .send()
        .await
        .unwrap();

    let head = head_rx.recv().await.unwrap();
    assert_eq!(*head.method(), http::Method::PUT);
    assert_eq!(head.uri().path(), "/items/7");
    assert_eq!(head.uri().query(), Some("verbose=1"));
    assert_eq!(head.headers()["x-trace"], "abc");
}

#[tokio::test]
async fn test_invalid_header_fails_send() {
    let server = TestServer::builder()
        .handler(|_ctx: RequestContext| async move { Ok(()) })
        .build()
        .unwrap();

    let result = server
        .client()
        .get("/")
        .header("bad header", "value")
        .send()
        .await;
    assert!(matches!(result, Err(HarnessError::Http(_))));
}

/// Bodies larger than the buffer limit flow through as the client drains.
#[tokio::test]
async fn test_large_body_with_flow_control() {
    let server = TestServer::builder()
        .response_buffer_limit(1024)
        .handler(|ctx: RequestContext| async move {
            for i in 0..16u8 {
                ctx.write(vec![i; 1024]).await?;
            }
            Ok(())
        })
        .build()
        .unwrap();

    let body = server
        .client()
        .get("/")
        .send()
        .default_timeout()
        .await
        .unwrap()
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(body.len(), 16 * 1024);
    assert!(body
        .chunks(1024)
        .enumerate()
        .all(|(i, chunk)| chunk.iter().all(|b| *b == i as u8)));
}
