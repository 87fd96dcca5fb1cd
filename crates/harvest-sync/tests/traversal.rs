mod common;

use std::time::Duration;

use common::{fixture, selectors, MockSession, PageScript};
use harvest_sync::capture::capture;
use harvest_sync::{PageTraversal, TraversalConfig, TraversalError, TraversalState};
use serde_json::json;

fn quick_config() -> TraversalConfig {
    TraversalConfig {
        max_steps: 100,
        wait: Duration::from_secs(1),
        poll: Duration::from_millis(100),
        max_stalls: None,
    }
}

fn titles(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn traversal_ends_when_next_control_disappears() {
    let mut session = MockSession::rendering(PageScript {
        pages: vec![titles(&["A", "B"]), titles(&["C", "D"]), titles(&["E"])],
        ..Default::default()
    });
    let mut traversal = PageTraversal::new(selectors(), quick_config());

    let report = traversal
        .run_to_exhaustion(&mut session)
        .await
        .expect("exhausts");

    assert_eq!(traversal.state(), TraversalState::Exhausted);
    assert_eq!(report.steps, 2);
    assert_eq!(report.stalled, 0);
    assert_eq!(session.stats().activations(), 2);
}

#[tokio::test(start_paused = true)]
async fn single_page_profile_needs_no_advance() {
    let mut session = MockSession::rendering(PageScript::profile(String::new()));
    let mut traversal = PageTraversal::new(selectors(), quick_config());

    assert_eq!(
        traversal.step(&mut session).await.expect("step"),
        TraversalState::Exhausted
    );
    assert_eq!(traversal.report().steps, 0);
    assert_eq!(session.stats().activations(), 0);
}

#[tokio::test(start_paused = true)]
async fn unchanging_content_is_stuck_after_ceiling() {
    let mut session = MockSession::rendering(PageScript {
        pages: vec![titles(&["A", "B"])],
        stuck: true,
        ..Default::default()
    });
    let mut traversal = PageTraversal::new(selectors(), quick_config());

    let err = traversal
        .run_to_exhaustion(&mut session)
        .await
        .expect_err("never exhausts");

    assert!(matches!(err, TraversalError::Stuck { steps: 100 }));
    assert_eq!(session.stats().activations(), 100);
    assert_eq!(traversal.report().stalled, 100);
}

#[tokio::test(start_paused = true)]
async fn stall_budget_fails_before_ceiling() {
    let mut session = MockSession::rendering(PageScript {
        pages: vec![titles(&["A", "B"])],
        stuck: true,
        ..Default::default()
    });
    let config = TraversalConfig {
        max_stalls: Some(3),
        ..quick_config()
    };
    let mut traversal = PageTraversal::new(selectors(), config);
    let started = tokio::time::Instant::now();

    let err = traversal
        .run_to_exhaustion(&mut session)
        .await
        .expect_err("stalls");

    assert!(matches!(err, TraversalError::Stalled { steps: 3, stalls: 3 }));
    assert_eq!(session.stats().activations(), 3);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn stall_budget_resets_when_content_changes() {
    let mut session = MockSession::rendering(PageScript {
        pages: vec![titles(&["A"]), titles(&["B"]), titles(&["C"]), titles(&["D"])],
        ..Default::default()
    });
    let config = TraversalConfig {
        max_stalls: Some(1),
        ..quick_config()
    };
    let mut traversal = PageTraversal::new(selectors(), config);

    let report = traversal
        .run_to_exhaustion(&mut session)
        .await
        .expect("exhausts");

    assert_eq!(report.steps, 3);
    assert_eq!(report.stalled, 0);
}

#[tokio::test(start_paused = true)]
async fn state_sequence_follows_pagination() {
    let mut session = MockSession::rendering(PageScript {
        pages: vec![titles(&["A"]), titles(&["B"])],
        ..Default::default()
    });
    let mut traversal = PageTraversal::new(selectors(), quick_config());
    assert_eq!(traversal.state(), TraversalState::Loaded);

    let mut seen = Vec::new();
    loop {
        let state = traversal.step(&mut session).await.expect("step");
        seen.push(state);
        if state == TraversalState::Exhausted {
            break;
        }
    }

    assert_eq!(
        seen,
        vec![
            TraversalState::HasMorePages,
            TraversalState::PageAdvanced,
            TraversalState::Exhausted,
        ]
    );
}

#[tokio::test]
async fn capture_skips_unretrievable_bodies() {
    let mut script = PageScript::profile(String::new())
        .with_response(
            "1000.1",
            "https://www.udemy.com/api-2.0/users/42/taught-profile-courses/?page=1",
            fixture("network/courses_page1.json"),
        )
        .with_response("1000.2", "https://www.udemy.com/api-2.0/event-tracking/", String::new());
    script.network.push(json!({
        "method": "Network.responseReceived",
        "params": {
            "requestId": "1000.9",
            "timestamp": 109.0,
            "response": { "url": "https://www.udemy.com/api-2.0/users/42/taught-profile-courses/?page=2" }
        }
    }));
    let mut session = MockSession::rendering(script);

    let all = capture(&mut session, None).await.expect("capture");
    assert_eq!(all.len(), 2);

    let items_only = capture(&mut session, Some("taught-profile-courses"))
        .await
        .expect("capture");
    assert_eq!(items_only.len(), 1);
    assert_eq!(items_only[0].timestamp, 100.0);
    assert!(items_only[0].body.contains("Intro"));
}
