//! End-to-end gate scenarios through `ScrollGate`.

use std::sync::Arc;
use std::time::Duration;

use scrollgate_core::unlock::RecordingEventSink;
use scrollgate_core::{
    ContentId, GateConfig, GateDb, MemoryPreferenceStore, MemoryProfileStore, ReasonCode,
    RequiredAction, ScrollGate, SessionOutcome, SubscriptionUpdate, UnlockState, UserEntitlement,
    UserId,
};
use tempfile::TempDir;

const CONFIG: &str = r#"{
    "content": [
        {"content_id": "pro-guide", "required_tier": "pro", "credit_cost": 0, "purchasable": false},
        {"content_id": "deep-dive", "required_tier": "pro", "credit_cost": 30, "purchasable": true},
        {"content_id": "legacy-vault", "required_tier": "legacy", "credit_cost": 9999, "purchasable": true},
        {"content_id": "creator-lab", "required_tier": "creator_pass"}
    ],
    "orchestrator": {"shake_ms": 10, "reveal_dwell_ms": 10, "prompt_timeout_secs": 30}
}"#;

fn memory_gate(users: Vec<UserEntitlement>) -> (ScrollGate, Arc<RecordingEventSink>) {
    let config = GateConfig::from_json(CONFIG).unwrap().build().unwrap();
    let store = Arc::new(MemoryProfileStore::with_users(users));
    let sink = Arc::new(RecordingEventSink::new());
    let gate = ScrollGate::new(
        config,
        store.clone(),
        store,
        Arc::new(MemoryPreferenceStore::new()),
        sink.clone(),
    );
    (gate, sink)
}

async fn wait_for_prompt(gate: &ScrollGate, session_id: scrollgate_core::SessionId) {
    for _ in 0..200 {
        if gate.session(session_id).await.map(|s| s.state) == Some(UnlockState::UpgradePrompt) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached the upgrade prompt");
}

#[tokio::test]
async fn scenario_a_free_user_on_pro_content() {
    let (gate, _) = memory_gate(vec![UserEntitlement::free("alice")]);

    let decision = gate
        .evaluate_access(&UserId::new("alice"), &ContentId::new("pro-guide"))
        .await
        .unwrap();
    assert!(!decision.granted());
    assert_eq!(decision.reason_code(), ReasonCode::InsufficientTier);
    assert_eq!(decision.required_action(), RequiredAction::UpgradeTier);
}

#[tokio::test]
async fn scenario_b_purchase_with_credits() {
    let (gate, _) = memory_gate(vec![UserEntitlement::free("bob").with_credits(50)]);
    let user = UserId::new("bob");
    let content = ContentId::new("deep-dive");

    let decision = gate.evaluate_access(&user, &content).await.unwrap();
    assert!(decision.granted());
    assert_eq!(decision.reason_code(), ReasonCode::Purchased);
    // Evaluation alone never spends
    assert_eq!(gate.ledger().balance(&user).await.unwrap(), 50);

    let token = gate.ledger().reserve(&user, 30).await.unwrap();
    gate.ledger().commit(&token).await.unwrap();
    assert_eq!(gate.ledger().balance(&user).await.unwrap(), 20);
}

#[tokio::test]
async fn scenario_c_pass_overrides_cost() {
    let (gate, _) = memory_gate(vec![UserEntitlement::free("carol").with_pass(true)]);

    let decision = gate
        .evaluate_access(&UserId::new("carol"), &ContentId::new("legacy-vault"))
        .await
        .unwrap();
    assert!(decision.granted());
    assert_eq!(decision.reason_code(), ReasonCode::PassOwned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_concurrent_unlocks_share_a_session() {
    let (gate, _) = memory_gate(vec![UserEntitlement::free("dave").with_credits(100)]);
    let gate = Arc::new(gate);
    let user = UserId::new("dave");
    let content = ContentId::new("deep-dive");

    let (a, b) = tokio::join!(
        gate.start_unlock(&user, &content),
        gate.start_unlock(&user, &content)
    );
    let session_id = a.unwrap();
    assert_eq!(session_id, b.unwrap());

    wait_for_prompt(&gate, session_id).await;
    let first = tokio::spawn({
        let gate = gate.clone();
        async move { gate.confirm_unlock(session_id).await }
    });
    let second = tokio::spawn({
        let gate = gate.clone();
        async move { gate.confirm_unlock(session_id).await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(gate.ledger().reservations_issued(), 1);
    assert_eq!(gate.ledger().balance(&user).await.unwrap(), 70);
}

#[tokio::test]
async fn creator_tier_requires_a_pass() {
    let (gate, _) = memory_gate(vec![UserEntitlement::free("erin").with_tier("legacy")]);

    let decision = gate
        .evaluate_access(&UserId::new("erin"), &ContentId::new("creator-lab"))
        .await
        .unwrap();
    assert_eq!(decision.reason_code(), ReasonCode::InsufficientTier);
    assert_eq!(decision.required_action(), RequiredAction::BuyPass);
}

#[tokio::test]
async fn full_unlock_against_embedded_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.redb");
    let db = Arc::new(GateDb::open(Some(path.to_str().unwrap())).unwrap());
    db.store_entitlement(&UserEntitlement::free("frank").with_credits(40))
        .unwrap();

    let config = GateConfig::from_json(CONFIG).unwrap().build().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let gate = ScrollGate::with_db(config, db.clone(), sink.clone());
    let user = UserId::new("frank");
    let content = ContentId::new("deep-dive");

    let session_id = gate.start_unlock(&user, &content).await.unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    gate.on_complete(session_id, move |outcome| {
        let _ = done_tx.send(outcome);
    })
    .await
    .unwrap();

    wait_for_prompt(&gate, session_id).await;
    assert_eq!(
        gate.confirm_unlock(session_id).await.unwrap(),
        UnlockState::Unlocking
    );
    let outcome = tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    // The debit is written through to disk and the scroll is marked opened
    let stored = db.get_entitlement(&user).unwrap().unwrap();
    assert_eq!(stored.entitlement.credit_balance, 10);
    assert_eq!(
        db.get_preference(&user, "scroll.opened.deep-dive").unwrap().as_deref(),
        Some("true")
    );
    assert_eq!(sink.transitions(session_id).len(), 7);
}

#[tokio::test]
async fn webhook_upgrade_is_seen_by_next_evaluation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.redb");
    let db = Arc::new(GateDb::open(Some(path.to_str().unwrap())).unwrap());
    let config = GateConfig::from_json(CONFIG).unwrap().build().unwrap();
    let gate = ScrollGate::with_db(config, db.clone(), Arc::new(RecordingEventSink::new()));
    let user = UserId::new("gina");
    let content = ContentId::new("pro-guide");

    assert!(!gate.evaluate_access(&user, &content).await.unwrap().granted());

    let update = SubscriptionUpdate {
        tier: Some("pro".into()),
        ..Default::default()
    };
    db.apply_subscription_update(&user, &update).unwrap();

    let decision = gate.evaluate_access(&user, &content).await.unwrap();
    assert!(decision.granted());
    assert_eq!(decision.reason_code(), ReasonCode::TierSufficient);
}
