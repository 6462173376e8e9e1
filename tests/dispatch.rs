mod common;

use common::{global_limit, too_many_requests, MockTransport, CHANNEL_A, CHANNEL_B};
use futures::future::join_all;
use http::{Method, StatusCode};
use ratelane::{
    ApiRequest, ApiResponse, ConfigError, DispatchError, Dispatcher, DispatcherConfig, RequestOptions,
    TokenAuth, TrackingSleeper, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn config(strategy: &str) -> DispatcherConfig {
    DispatcherConfig { sweep_interval_secs: 0, strategy: strategy.into(), ..Default::default() }
}

fn dispatcher(transport: Arc<MockTransport>, strategy: &str) -> Dispatcher {
    Dispatcher::builder()
        .config(config(strategy))
        .transport(transport)
        .auth(TokenAuth::application("abc"))
        .build()
        .expect("valid configuration")
}

#[tokio::test(start_paused = true)]
async fn requests_on_one_route_are_issued_in_submission_order() {
    let transport = MockTransport::with_latency(Duration::from_millis(10));
    let d = dispatcher(transport.clone(), "burst");

    let futures: Vec<_> = (0..5)
        .map(|i| d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new().query("n", i.to_string())))
        .collect();
    for result in join_all(futures).await {
        result.expect("request succeeds");
    }

    let order: Vec<String> = transport.sent().into_iter().filter_map(|s| s.query).collect();
    assert_eq!(order, vec!["n=0", "n=1", "n=2", "n=3", "n=4"]);

    // Strictly serialized: each request went out after the previous one finished.
    let sent = transport.sent();
    for pair in sent.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(10));
    }
}

#[tokio::test(start_paused = true)]
async fn a_throttled_route_does_not_delay_other_routes() {
    let transport = MockTransport::new();
    transport.script(CHANNEL_A, Ok(too_many_requests("5")));
    let d = dispatcher(transport.clone(), "burst");

    let a = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());
    let b = d.dispatch(Method::GET, CHANNEL_B, RequestOptions::new());

    b.await.expect("route B unaffected");
    let b_sent = &transport.sent_to(CHANNEL_B)[0];
    assert!(transport.offset(b_sent) < Duration::from_secs(1));

    a.await.expect("route A succeeds after cooldown");
    let a_sent = transport.sent_to(CHANNEL_A);
    assert_eq!(a_sent.len(), 2, "one 429 then one retry");
    assert!(a_sent[1].at.duration_since(a_sent[0].at) >= Duration::from_secs(5));
    assert!(!d.is_globally_rate_limited());
}

#[tokio::test(start_paused = true)]
async fn a_global_limit_pauses_every_route() {
    let transport = MockTransport::new();
    transport.script(CHANNEL_A, Ok(global_limit("2")));
    let d = dispatcher(transport.clone(), "burst");

    let a = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());
    while !d.is_globally_rate_limited() {
        tokio::task::yield_now().await;
    }
    let b = d.dispatch(Method::GET, CHANNEL_B, RequestOptions::new());

    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    let b_sent = &transport.sent_to(CHANNEL_B)[0];
    assert!(
        transport.offset(b_sent) >= Duration::from_secs(2),
        "route B must wait out the global limit, went at {:?}",
        transport.offset(b_sent)
    );
    assert!(!d.is_globally_rate_limited());
}

#[tokio::test(start_paused = true)]
async fn persistent_rate_limits_are_surfaced_after_the_retry_budget() {
    let transport = MockTransport::new();
    for _ in 0..3 {
        transport.script(CHANNEL_A, Ok(too_many_requests("0.5")));
    }
    let d = Dispatcher::builder()
        .config(DispatcherConfig { max_rate_limit_retries: 2, ..config("burst") })
        .transport(transport.clone())
        .auth(TokenAuth::application("abc"))
        .build()
        .unwrap();

    let err = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new()).await.unwrap_err();
    match err {
        DispatchError::RateLimited { route, retry_after, attempts } => {
            assert_eq!(route.as_str(), CHANNEL_A);
            assert_eq!(retry_after, Duration::from_millis(500));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // The route keeps working once the API stops refusing.
    d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sequential_strategy_waits_for_an_exhausted_bucket() {
    let transport = MockTransport::new();
    transport.script(
        CHANNEL_A,
        Ok(ApiResponse::new(StatusCode::OK)
            .with_header("x-ratelimit-remaining", "0")
            .with_header("x-ratelimit-reset-after", "3")),
    );
    let d = dispatcher(transport.clone(), "sequential");

    let first = d.dispatch(Method::POST, CHANNEL_A, RequestOptions::new().body("one"));
    let second = d.dispatch(Method::POST, CHANNEL_A, RequestOptions::new().body("two"));
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    let sent = transport.sent_to(CHANNEL_A);
    assert_eq!(sent.len(), 2);
    assert!(sent[1].at.duration_since(sent[0].at) >= Duration::from_secs(3));
}

#[tokio::test]
async fn configured_sleeper_drives_sequential_bucket_waits() {
    let transport = MockTransport::new();
    transport.script(
        CHANNEL_A,
        Ok(ApiResponse::new(StatusCode::OK)
            .with_header("x-ratelimit-limit", "5")
            .with_header("x-ratelimit-remaining", "0")
            .with_header("x-ratelimit-reset-after", "3")),
    );
    let sleeper = TrackingSleeper::new();
    let d = Dispatcher::builder()
        .config(config("sequential"))
        .transport(transport.clone())
        .auth(TokenAuth::application("abc"))
        .sleeper(Arc::new(sleeper.clone()))
        .build()
        .unwrap();

    d.dispatch(Method::POST, CHANNEL_A, RequestOptions::new()).await.unwrap();
    assert_eq!(sleeper.calls(), vec![Duration::from_secs(3)]);
}

#[tokio::test]
async fn transport_failures_reject_only_that_request() {
    let transport = MockTransport::new();
    transport.script(
        CHANNEL_A,
        Ok(ApiResponse::new(StatusCode::FORBIDDEN).with_body(r#"{"code":50013}"#)),
    );
    transport.script(CHANNEL_A, Err(TransportError::Connection("reset by peer".into())));
    let d = dispatcher(transport.clone(), "burst");

    let forbidden = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());
    let reset = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());
    let fine = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());

    let err = forbidden.await.unwrap_err();
    let transport_err = err.as_transport().expect("transport error");
    assert_eq!(transport_err.status(), Some(StatusCode::FORBIDDEN));
    assert!(matches!(transport_err, TransportError::Status { body, .. } if body == br#"{"code":50013}"#));

    assert!(matches!(
        reset.await,
        Err(DispatchError::Transport(TransportError::Connection(_)))
    ));
    assert_eq!(fine.await.unwrap().text(), CHANNEL_A);
}

#[tokio::test]
async fn endpoint_changes_apply_to_later_requests() {
    let transport = MockTransport::new();
    let d = dispatcher(transport.clone(), "burst");

    d.dispatch(Method::GET, "/gateway", RequestOptions::new()).await.unwrap();
    d.set_endpoint("https://canary.discord.com/api").unwrap();
    d.dispatch(Method::GET, "/gateway", RequestOptions::new()).await.unwrap();

    let hosts: Vec<String> = transport.sent().into_iter().map(|s| s.host).collect();
    assert_eq!(hosts, vec!["discord.com", "canary.discord.com"]);

    let err = d.set_endpoint("mailto:ops@example.com").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
}

#[tokio::test]
async fn unknown_strategy_names_fail_at_build_time() {
    let err = Dispatcher::builder()
        .config(config("Fastest"))
        .transport(MockTransport::new())
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::InvalidStrategy { name: "Fastest".into() });

    // Names are case-insensitive.
    assert!(Dispatcher::builder().config(config("BURST")).transport(MockTransport::new()).build().is_ok());
}

#[tokio::test]
async fn invalid_paths_never_reach_the_transport() {
    let transport = MockTransport::new();
    let d = dispatcher(transport.clone(), "burst");

    let err = d.dispatch(Method::GET, "gateway", RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidPath { ref path } if path == "gateway"));
    assert!(transport.sent().is_empty());
    assert_eq!(d.handler_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_queued_requests() {
    let transport = MockTransport::with_latency(Duration::from_secs(1));
    let d = dispatcher(transport.clone(), "burst");

    let in_flight = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());
    let queued: Vec<_> = (0..2).map(|_| d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new())).collect();
    transport.wait_for(1).await;

    d.shutdown();

    assert!(in_flight.await.is_ok(), "the request already issued completes");
    for result in join_all(queued).await {
        assert!(matches!(result, Err(DispatchError::Abandoned)));
    }
    assert_eq!(transport.sent().len(), 1);

    let late = d.dispatch(Method::GET, CHANNEL_B, RequestOptions::new()).await;
    assert!(matches!(late, Err(DispatchError::Abandoned)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_does_not_wait_out_a_global_cooldown() {
    let transport = MockTransport::new();
    transport.script(CHANNEL_A, Ok(global_limit("600")));
    let d = dispatcher(transport.clone(), "burst");

    let a = d.dispatch(Method::GET, CHANNEL_A, RequestOptions::new());
    while !d.is_globally_rate_limited() {
        tokio::task::yield_now().await;
    }
    let b = d.dispatch(Method::GET, CHANNEL_B, RequestOptions::new());
    tokio::task::yield_now().await;

    d.shutdown();
    assert_eq!(d.handler_count(), 0);

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
        .await
        .expect("queued requests resolve promptly after shutdown");
    assert!(matches!(a, Err(DispatchError::Abandoned)));
    assert!(matches!(b, Err(DispatchError::Abandoned)));
    assert_eq!(transport.sent().len(), 1, "nothing is issued after shutdown");
}

#[tokio::test]
async fn dispatcher_is_a_tower_service() {
    let transport = MockTransport::new();
    let d = dispatcher(transport.clone(), "burst");

    let request = ApiRequest::new(Method::GET, "/users/@me", RequestOptions::new());
    let response = d.clone().oneshot(request).await.unwrap();
    assert_eq!(response.text(), "/users/@me");

    d.shutdown();
    let request = ApiRequest::new(Method::GET, "/users/@me", RequestOptions::new());
    assert!(matches!(d.oneshot(request).await, Err(DispatchError::Abandoned)));
}
