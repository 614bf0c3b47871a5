//! wait_for_selector and wait_for_function: world routing, adoption, and
//! cancellation on frame detach.

mod support;

use std::sync::Arc;

use frame_coordinator::{
    FrameError, SelectorState, WaitForFunctionOptions, WaitForSelectorOptions, World,
};
use serde_json::{json, Value};
use support::{fid, harness, harness_with, yield_many, MockContext, MockDelegate, MockElement,
    MockHandle, MockPoll, MockSelectorEngine};

#[tokio::test]
async fn selector_resolved_in_main_world_is_returned_directly() {
    let h = harness();
    let main = h.manager.frame_attached(fid("main"), None);
    let context = MockContext::new(World::Main);
    main.context_created(World::Main, context.clone());
    h.engine.push_element(MockElement::connected(context));

    let element = main
        .wait_for_selector("#a", WaitForSelectorOptions::default())
        .await
        .unwrap()
        .expect("element expected");
    assert_eq!(element.execution_context().world(), World::Main);
}

#[tokio::test]
async fn selector_resolved_in_utility_world_is_adopted_into_main() {
    let engine = MockSelectorEngine::in_world(World::Utility);
    let h = harness_with(MockDelegate::new(), engine);
    let main = h.manager.frame_attached(fid("main"), None);

    let utility = MockContext::new(World::Utility);
    let main_world = MockContext::new(World::Main);
    main.context_created(World::Utility, utility.clone());
    main.context_created(World::Main, main_world);

    let found = MockElement::connected(utility);
    h.engine.push_element(Arc::clone(&found));

    let element = main
        .wait_for_selector("#a", WaitForSelectorOptions::default())
        .await
        .unwrap()
        .expect("element expected");

    // The delegate adopted the handle into the main world and the original
    // utility-world handle was released.
    assert_eq!(element.execution_context().world(), World::Main);
    assert!(found.disposed.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn hidden_wait_resolves_with_none_when_nothing_matches() {
    let h = harness();
    let main = h.manager.frame_attached(fid("main"), None);
    let context = MockContext::new(World::Main);
    main.context_created(World::Main, context);
    h.engine
        .push_wait_result(Ok(MockHandle::value(Value::Null) as Arc<_>));

    let element = main
        .wait_for_selector(
            "#gone",
            WaitForSelectorOptions {
                state: SelectorState::Hidden,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(element.is_none());
}

#[tokio::test]
async fn wait_for_selector_rejects_when_the_frame_detaches() {
    let h = harness();
    let main = h.manager.frame_attached(fid("main"), None);
    main.context_created(World::Main, MockContext::new(World::Main));
    // Empty queue keeps the poll pending.

    let waiting = Arc::clone(&main);
    let wait = tokio::spawn(async move {
        waiting
            .wait_for_selector("#a", WaitForSelectorOptions::default())
            .await
    });
    yield_many().await;
    assert!(!wait.is_finished());

    h.manager.frame_detached(&main.id());

    let error = wait.await.unwrap().unwrap_err();
    assert!(matches!(error, FrameError::FrameDetached(_)));
}

#[tokio::test]
async fn wait_for_function_resolves_with_the_poll_result() {
    let h = harness();
    let main = h.manager.frame_attached(fid("main"), None);
    let context = MockContext::new(World::Main);
    context.push_function_poll(MockPoll::resolved(
        MockHandle::value(json!(true)) as Arc<_>
    ));
    main.context_created(World::Main, context);

    let handle = main
        .wait_for_function(
            "() => window.ready",
            Value::Null,
            WaitForFunctionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(handle.json_value().await.unwrap(), json!(true));
}

#[tokio::test]
async fn wait_for_function_survives_context_recycling() {
    let h = harness();
    let main = h.manager.frame_attached(fid("main"), None);

    // First context dies mid-poll; the replacement produces the result.
    let dying = MockContext::new(World::Main);
    dying.push_function_poll(MockPoll::failing(FrameError::Evaluation(
        "Execution context was destroyed".to_string(),
    )));
    let healthy = MockContext::new(World::Main);
    healthy.push_function_poll(MockPoll::resolved(
        MockHandle::value(json!(42)) as Arc<_>
    ));

    let waiting = Arc::clone(&main);
    let wait = tokio::spawn(async move {
        waiting
            .wait_for_function("() => window.answer", Value::Null, Default::default())
            .await
    });
    yield_many().await;

    main.context_created(World::Main, dying.clone());
    yield_many().await;
    assert!(!wait.is_finished());

    main.context_destroyed(&(dying as Arc<dyn frame_coordinator::ExecutionContext>));
    main.context_created(World::Main, healthy);

    let handle = wait.await.unwrap().unwrap();
    assert_eq!(handle.json_value().await.unwrap(), json!(42));
}

#[tokio::test]
async fn dispatch_event_runs_the_scheduled_task() {
    let h = harness();
    let main = h.manager.frame_attached(fid("main"), None);
    let context = MockContext::new(World::Main);
    main.context_created(World::Main, context.clone());
    h.engine.push_element(MockElement::connected(context));

    main.dispatch_event("#a", "click", json!({}), None)
        .await
        .unwrap();
}
