use std::time::Duration;

use super::{config, harness};
use crate::remote::{OperationKind, OperationParams, RawFailure};
use crate::session::SessionStatus;

#[tokio::test(start_paused = true)]
async fn test_idle_market_limiters_are_swept() {
    let mut config = config();
    config.rate_limits.resource_idle_secs = 10;
    config.rate_limits.sweep_interval_secs = 5;
    let h = harness(config);
    let tasks = h.dispatcher.start_background();

    h.dispatcher
        .call(
            OperationKind::ListMarketBook,
            &OperationParams::default().with_market_ids(["1.1", "1.2"]),
        )
        .await
        .unwrap();
    assert_eq!(h.dispatcher.limiters().resource_limiter_count(), 2);

    tokio::time::sleep(Duration::from_secs(7)).await;
    h.dispatcher
        .call(
            OperationKind::ListMarketBook,
            &OperationParams::default().with_market_ids(["1.2"]),
        )
        .await
        .unwrap();

    // 1.1 idles out at t=10 and goes at the t=10 sweep; 1.2 was used at t=7.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!h.dispatcher.limiters().has_resource_limiter("1.1"));
    assert!(h.dispatcher.limiters().has_resource_limiter("1.2"));

    // Within one sweep interval of its own idle window (t=17) it is gone too.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.dispatcher.limiters().resource_limiter_count(), 0);
    assert_eq!(h.dispatcher.limiters().metrics().evicted_total, 2);

    tasks.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_failure_triggers_relogin_on_next_call() {
    let mut config = config();
    config.session.keep_alive_interval_secs = 60;
    let h = harness(config);
    h.auth.push_keep_alive(Err(RawFailure::http(503, "")));

    h.dispatcher
        .call(OperationKind::ListEventTypes, &OperationParams::default())
        .await
        .unwrap();
    let tasks = h.dispatcher.start_background();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.auth.keep_alive_tokens(), vec!["token-1"]);
    assert_eq!(h.dispatcher.session().status(), SessionStatus::Expiring);

    h.dispatcher
        .call(OperationKind::ListEventTypes, &OperationParams::default())
        .await
        .unwrap();
    assert_eq!(h.remote.tokens(), vec!["token-1", "token-2"]);
    assert_eq!(h.dispatcher.session().status(), SessionStatus::Active);

    // The next round refreshes the new token
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.auth.keep_alive_tokens(), vec!["token-1", "token-2"]);

    tasks.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_foreground_calls_running() {
    let h = harness(config());
    h.remote
        .push_failures(RawFailure::http(503, "unavailable"), 2);
    let tasks = h.dispatcher.start_background();

    let dispatcher = h.dispatcher.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .call(OperationKind::ListEvents, &OperationParams::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    tasks.shutdown().await;
    assert!(call.await.unwrap().is_ok());
    assert_eq!(h.remote.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_logout_after_shutdown() {
    let h = harness(config());
    let tasks = h.dispatcher.start_background();
    h.dispatcher
        .call(OperationKind::GetAccountDetails, &OperationParams::default())
        .await
        .unwrap();

    tasks.shutdown().await;
    h.dispatcher.logout().await.unwrap();
    assert_eq!(h.auth.logout_calls(), 1);
    assert_eq!(
        h.dispatcher.session().status(),
        SessionStatus::Unauthenticated
    );
}
