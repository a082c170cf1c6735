use kickbot_sync_core::dispatcher::SYNC_PUSH_PATH;
use kickbot_sync_core::store::QueueStore;
use kickbot_sync_core::{
    Dispatched, DrainReport, Entity, Method, MutationRequest, Notice, SyncError, TransportError,
};
use kickbot_sync_test_utils::{mutation, Harness};
use proptest::prelude::*;
use serde_json::{json, Value};

const GROUPS: &str = "/dashboard/api/groups";

fn pushed_bodies(h: &Harness) -> Vec<Vec<Value>> {
    h.transport
        .requests_to(Method::Post, SYNC_PUSH_PATH)
        .into_iter()
        .map(|r| match r.body {
            Some(Value::Array(items)) => items,
            other => panic!("push body is not an array: {other:?}"),
        })
        .collect()
}

async fn queue_offline(h: &Harness, names: &[&str]) {
    h.client.network().set_online(false);
    for name in names {
        let outcome = h
            .client
            .submit(MutationRequest::create_group(name, "chan", 60))
            .await
            .unwrap();
        assert!(matches!(outcome, Dispatched::Queued(_)));
    }
    h.client.network().set_online(true);
}

#[tokio::test]
async fn offline_create_is_queued_without_a_request() {
    let h = Harness::new();
    h.client.network().set_online(false);

    let outcome = h
        .client
        .submit(MutationRequest::create_group("G1", "t1", 5))
        .await
        .unwrap();

    let Dispatched::Queued(queued) = outcome else {
        panic!("expected queued outcome");
    };
    assert_eq!(queued.entity, Entity::Group);
    assert_eq!(queued.action, "create");
    assert_eq!(
        queued.payload,
        json!({"name": "G1", "target": "t1", "interval": 5})
    );
    assert!(queued.event_id.is_some());

    assert_eq!(h.transport.total_calls(), 0);
    assert_eq!(h.dashboard.notices(), vec![Notice::queued_offline()]);
    assert_eq!(h.session_queue().await, vec![queued]);
}

#[tokio::test]
async fn unreachable_server_queues_while_online() {
    let h = Harness::new();
    h.transport
        .fail(Method::Post, GROUPS, TransportError::Timeout);

    let outcome = h
        .client
        .submit(MutationRequest::create_group("G1", "chan", 60))
        .await
        .unwrap();

    assert!(matches!(outcome, Dispatched::Queued(_)));
    assert_eq!(h.transport.calls(Method::Post, GROUPS), 1);
    assert_eq!(h.session_queue().await.len(), 1);
}

#[tokio::test]
async fn reconnect_pushes_everything_in_one_batch() {
    let h = Harness::new();
    queue_offline(&h, &["A", "B"]).await;
    h.transport.ok(Method::Post, SYNC_PUSH_PATH, json!({"ok": true}));

    assert_eq!(h.client.drain().await, DrainReport::Pushed { count: 2 });

    let bodies = pushed_bodies(&h);
    assert_eq!(bodies.len(), 1);
    let names: Vec<&Value> = bodies[0].iter().map(|m| &m["payload"]["name"]).collect();
    assert_eq!(names, vec![&json!("A"), &json!("B")]);
    assert!(h.session_queue().await.is_empty());
}

#[tokio::test]
async fn rejected_push_keeps_the_queue_intact() {
    let h = Harness::new();
    queue_offline(&h, &["A", "B", "C"]).await;
    let before = h.session_queue().await;
    h.transport
        .reply(Method::Post, SYNC_PUSH_PATH, 500, json!({"error": "boom"}));

    assert_eq!(
        h.client.drain().await,
        DrainReport::Failed {
            pushed: 0,
            pending: 3
        }
    );
    assert_eq!(h.session_queue().await, before);
}

#[tokio::test]
async fn unreachable_push_keeps_the_queue_intact() {
    let h = Harness::new();
    queue_offline(&h, &["A"]).await;
    h.transport
        .fail(Method::Post, SYNC_PUSH_PATH, TransportError::Connect("refused".into()));

    assert!(matches!(h.client.drain().await, DrainReport::Failed { .. }));
    assert_eq!(h.session_queue().await.len(), 1);
}

#[tokio::test]
async fn empty_queue_sends_nothing() {
    let h = Harness::new();
    assert_eq!(h.client.drain().await, DrainReport::Empty);
    assert_eq!(h.transport.total_calls(), 0);
}

#[tokio::test]
async fn offline_drain_is_skipped() {
    let h = Harness::new();
    queue_offline(&h, &["A"]).await;
    h.client.network().set_online(false);

    assert_eq!(h.client.drain().await, DrainReport::Offline);
    assert_eq!(h.transport.total_calls(), 0);
}

#[tokio::test]
async fn concurrent_drains_push_once() {
    let h = Harness::new();
    queue_offline(&h, &["A"]).await;
    h.transport.ok(Method::Post, SYNC_PUSH_PATH, json!({"ok": true}));
    let release = h.transport.hold(Method::Post, SYNC_PUSH_PATH);

    let (first, second) = tokio::join!(h.client.drain(), async {
        let report = h.client.drain().await;
        release.notify_one();
        report
    });

    assert_eq!(first, DrainReport::Pushed { count: 1 });
    assert_eq!(second, DrainReport::AlreadyRunning);
    assert_eq!(h.transport.calls(Method::Post, SYNC_PUSH_PATH), 1);
}

#[tokio::test]
async fn session_queue_drains_before_background_store() {
    let h = Harness::new();
    queue_offline(&h, &["manual"]).await;
    h.background
        .append(mutation(Entity::Account, "create", json!({"username": "bg"})))
        .await
        .unwrap();
    h.transport.ok(Method::Post, SYNC_PUSH_PATH, json!({"ok": true}));

    assert_eq!(h.client.drain().await, DrainReport::Pushed { count: 2 });

    let bodies = pushed_bodies(&h);
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0][0]["payload"]["name"], "manual");
    assert_eq!(bodies[1][0]["payload"]["username"], "bg");
    assert!(h.background.is_empty().await);
}

#[tokio::test]
async fn background_failure_keeps_its_batch_after_session_batch_lands() {
    let h = Harness::new();
    queue_offline(&h, &["manual"]).await;
    h.background
        .append(mutation(Entity::Account, "create", json!({"username": "bg"})))
        .await
        .unwrap();
    h.transport
        .ok(Method::Post, SYNC_PUSH_PATH, json!({"ok": true}))
        .reply(Method::Post, SYNC_PUSH_PATH, 500, json!({"error": "boom"}));

    assert_eq!(
        h.client.drain().await,
        DrainReport::Failed {
            pushed: 1,
            pending: 1
        }
    );
    assert!(h.session_queue().await.is_empty());
    let left = h.background.load().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].payload["username"], "bg");
}

#[tokio::test]
async fn domain_error_is_shown_and_not_queued() {
    let h = Harness::new();
    h.transport
        .ok(Method::Post, GROUPS, json!({"error": "duplicate name"}));

    let err = h
        .client
        .submit(MutationRequest::create_group("G1", "chan", 60))
        .await
        .unwrap_err();

    assert!(matches!(&err, SyncError::Domain(m) if m == "duplicate name"));
    assert_eq!(
        h.dashboard.notices(),
        vec![Notice::Failure("duplicate name".into())]
    );
    assert!(h.session_queue().await.is_empty());
}

#[tokio::test]
async fn delivered_create_refreshes_and_confirms() {
    let h = Harness::new();
    h.transport
        .ok(Method::Post, GROUPS, json!({"id": 1}))
        .ok(Method::Get, GROUPS, json!({"items": [{"id": 1, "name": "G1"}], "total": 1}));

    let outcome = h
        .client
        .submit(MutationRequest::create_group("G1", "chan", 60))
        .await
        .unwrap();

    assert_eq!(outcome, Dispatched::Delivered(json!({"id": 1})));
    assert_eq!(h.dashboard.render_count(Entity::Group), 1);
    assert_eq!(
        h.dashboard.notices(),
        vec![Notice::Success("Group created".into())]
    );
    assert_eq!(h.transport.calls(Method::Post, SYNC_PUSH_PATH), 0);
}

#[tokio::test]
async fn delivered_submit_flushes_earlier_queue() {
    let h = Harness::new();
    queue_offline(&h, &["A"]).await;
    h.transport
        .ok(Method::Post, GROUPS, json!({"id": 2}))
        .ok(Method::Get, GROUPS, json!([]))
        .ok(Method::Post, SYNC_PUSH_PATH, json!({"ok": true}));

    h.client
        .submit(MutationRequest::create_group("B", "chan", 60))
        .await
        .unwrap();

    assert_eq!(h.transport.calls(Method::Post, SYNC_PUSH_PATH), 1);
    assert!(h.session_queue().await.is_empty());
}

#[tokio::test]
async fn delete_while_offline_is_refused() {
    let h = Harness::new();
    h.client.network().set_online(false);

    let err = h
        .client
        .submit(MutationRequest::delete_group(4))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::Transport(TransportError::Offline)
    ));
    assert!(h.session_queue().await.is_empty());
}

#[tokio::test]
async fn discard_pending_empties_every_store() {
    let h = Harness::new();
    queue_offline(&h, &["A"]).await;
    h.background
        .append(mutation(Entity::Bot, "stop", json!({"id": 1})))
        .await
        .unwrap();

    assert_eq!(h.client.dispatcher().discard_pending().await.unwrap(), 2);
    assert!(h.client.dispatcher().pending().await.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_drain_preserves_submission_order(
        names in proptest::collection::vec("[a-z]{2,8}", 1..8)
    ) {
        let pushed = tokio_test::block_on(async {
            let h = Harness::new();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            queue_offline(&h, &refs).await;
            h.transport.ok(Method::Post, SYNC_PUSH_PATH, json!({"ok": true}));
            let report = h.client.drain().await;
            assert_eq!(report, DrainReport::Pushed { count: names.len() });
            pushed_bodies(&h)
        });

        prop_assert_eq!(pushed.len(), 1);
        let sent: Vec<String> = pushed[0]
            .iter()
            .filter_map(|m| m["payload"]["name"].as_str().map(str::to_string))
            .collect();
        prop_assert_eq!(sent, names);
    }
}
