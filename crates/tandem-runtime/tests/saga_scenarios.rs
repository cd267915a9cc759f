//! End-to-end flows driven through the in-memory storage backend.

use std::sync::{Arc, Mutex};

use tandem_core::definition::{ModelOptions, StepDefinition};
use tandem_core::events::EventKind;
use tandem_core::flow::FlowState;
use tandem_core::step::{Phase, StepState};
use tandem_core::storage::SagaStorage;
use tandem_runtime::testing::{ScriptedHandler, StepBehavior};
use tandem_runtime::{MemoryStorage, Orchestrator};

fn orchestrator(definition: StepDefinition) -> (Orchestrator, Arc<MemoryStorage>) {
    orchestrator_with(definition, ModelOptions::default())
}

fn orchestrator_with(
    definition: StepDefinition,
    options: ModelOptions,
) -> (Orchestrator, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let orchestrator =
        Orchestrator::new("orders", definition, options, storage.clone()).expect("valid model");
    (orchestrator, storage)
}

#[tokio::test]
async fn linear_happy_path() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a").next(StepDefinition::action("b")),
    ]);
    let (orchestrator, storage) = orchestrator(definition);
    let script = ScriptedHandler::new();

    let mut tx = orchestrator
        .begin_transaction("tx-1", script.handler(), serde_json::json!({"order": 1}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Done);
    assert_eq!(
        tx.flow.step("_root.a").unwrap().invoke.state,
        StepState::Done
    );
    assert_eq!(
        tx.flow.step("_root.a.b").unwrap().invoke.state,
        StepState::Done
    );
    assert_eq!(script.invocations().len(), 2);
    assert!(tx.errors.is_empty());
    assert!(!tx.is_partially_completed());
    // Terminal flows have no live checkpoint.
    assert!(storage.get("orders:tx-1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn parallel_children_dispatch_by_depth_in_definition_order() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a"),
        StepDefinition::action("b")
            .next(StepDefinition::action("c").next(StepDefinition::action("e"))),
        StepDefinition::action("d").next(StepDefinition::action("f")),
    ]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();

    let mut tx = orchestrator
        .begin_transaction("tx-2", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Done);
    assert_eq!(
        script.invoked_actions(Phase::Invoke),
        vec!["a", "b", "d", "c", "f", "e"]
    );
    Ok(())
}

#[tokio::test]
async fn retry_exhaustion_compensates_completed_steps() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a").next(StepDefinition::action("b")),
    ]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();
    script.on_invoke("b", StepBehavior::Fail("downstream refused".into()));

    let mut tx = orchestrator
        .begin_transaction("tx-3", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Reverted);
    assert_eq!(script.count("a", Phase::Invoke), 1);
    // Default budget: 1 initial attempt + 3 retries.
    assert_eq!(script.count("b", Phase::Invoke), 4);
    assert_eq!(script.count("a", Phase::Compensate), 1);
    assert_eq!(script.count("b", Phase::Compensate), 1);
    assert_eq!(tx.flow.step("_root.a").unwrap().compensate.state, StepState::Reverted);
    assert_eq!(tx.errors.len(), 1);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_without_compensation_fails_flow() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a").max_retries(3).no_compensation(),
    ]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();
    script.on_invoke("a", StepBehavior::Fail("always broken".into()));

    let mut tx = orchestrator
        .begin_transaction("tx-4", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Failed);
    assert_eq!(script.count("a", Phase::Invoke), 4);
    assert_eq!(script.count("a", Phase::Compensate), 0);
    assert_eq!(tx.errors.len(), 1);
    let a = tx.flow.step("_root.a").unwrap();
    assert_eq!(a.invoke.state, StepState::Failed);
    assert_eq!(a.failures, 4);
    Ok(())
}

#[tokio::test]
async fn continue_on_permanent_failure_skips_subtree() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![StepDefinition::action("a").next(
        StepDefinition::action("b")
            .continue_on_permanent_failure()
            .max_retries(1)
            .next(StepDefinition::action("c")),
    )]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();
    script.on_invoke("b", StepBehavior::Fail("not critical".into()));

    let mut tx = orchestrator
        .begin_transaction("tx-5", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Done);
    assert_eq!(script.count("b", Phase::Invoke), 2);
    assert_eq!(script.count("c", Phase::Invoke), 0);
    assert_eq!(tx.flow.step("_root.a").unwrap().invoke.state, StepState::Done);
    assert_eq!(tx.flow.step("_root.a.b").unwrap().invoke.state, StepState::Failed);
    assert_eq!(
        tx.flow.step("_root.a.b.c").unwrap().invoke.state,
        StepState::Skipped
    );
    assert!(tx.flow.has_failed_steps);
    assert!(tx.flow.has_skipped_steps);
    assert!(tx.is_partially_completed());
    Ok(())
}

#[tokio::test]
async fn forwarded_responses_reach_children() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![StepDefinition::action("a")
        .forward_response()
        .next(
            StepDefinition::action("b")
                .forward_response()
                .next(StepDefinition::action("c")),
        )]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();
    script.on_invoke("a", StepBehavior::Succeed(serde_json::json!({"abc": 1234})));
    script.on_invoke("b", StepBehavior::Succeed(serde_json::json!({"def": "567"})));

    let input = serde_json::json!({"origin": "cart"});
    let mut tx = orchestrator
        .begin_transaction("tx-6", script.handler(), input.clone())
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Done);
    let invocations = script.invocations();
    let b_payload = &invocations.iter().find(|i| i.action == "b").unwrap().payload;
    assert_eq!(
        b_payload.data,
        serde_json::json!({"origin": "cart", "_response": {"abc": 1234}})
    );
    let c_payload = &invocations.iter().find(|i| i.action == "c").unwrap().payload;
    assert_eq!(
        c_payload.data,
        serde_json::json!({"origin": "cart", "_response": {"def": "567"}})
    );
    // Responses are also kept in the transaction context.
    assert_eq!(
        tx.context["a"].get(Phase::Invoke),
        Some(&serde_json::json!({"abc": 1234}))
    );
    Ok(())
}

#[tokio::test]
async fn no_wait_dispatches_children_early() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a").next(StepDefinition::action("e")),
        StepDefinition::action("b")
            .no_wait()
            .next(StepDefinition::action("d")),
        StepDefinition::action("c"),
    ]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();
    script.on_invoke("c", StepBehavior::Fail("flaky sibling".into()));

    let mut tx = orchestrator
        .begin_transaction("tx-8", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Reverted);
    let order = script.invoked_actions(Phase::Invoke);
    let d_at = order.iter().position(|a| a == "d").expect("d dispatched");
    let c_settled_at = order.iter().rposition(|a| a == "c").unwrap();
    assert!(
        d_at < c_settled_at,
        "d must dispatch before its sibling branch settles: {order:?}"
    );
    // e never ran: its predecessor branch failed before unblocking it.
    assert_eq!(script.count("e", Phase::Invoke), 0);
    assert_eq!(script.count("d", Phase::Compensate), 1);
    Ok(())
}

#[tokio::test]
async fn payload_metadata_carries_idempotency_key() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![StepDefinition::action("a")]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();

    let mut tx = orchestrator
        .begin_transaction("tx-meta", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    let invocation = &script.invocations()[0];
    let metadata = &invocation.payload.metadata;
    assert_eq!(metadata.producer, "orders");
    assert_eq!(metadata.reply_to_topic, "trans:orders");
    assert_eq!(metadata.idempotency_key, "tx-meta:a:invoke");
    assert_eq!(metadata.action_type, Phase::Invoke);
    assert_eq!(metadata.attempt, 1);
    Ok(())
}

#[tokio::test]
async fn lifecycle_events_follow_state_changes() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a").next(StepDefinition::action("b")),
    ]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::Begin,
        EventKind::Resume,
        EventKind::StepBegin,
        EventKind::StepSuccess,
        EventKind::Finish,
    ] {
        let seen = seen.clone();
        orchestrator.events().on(kind, move |event| {
            seen.lock().unwrap().push(event.kind());
        });
    }

    let mut tx = orchestrator
        .begin_transaction("tx-events", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            EventKind::Begin,
            EventKind::Resume,
            EventKind::StepBegin,
            EventKind::StepSuccess,
            EventKind::StepBegin,
            EventKind::StepSuccess,
            EventKind::Finish,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn finished_flow_archives_when_retention_is_set() -> anyhow::Result<()> {
    let definition = StepDefinition::root(vec![StepDefinition::action("a")]);
    let options = ModelOptions {
        retention_time: Some(3600),
        ..ModelOptions::default()
    };
    let (orchestrator, storage) = orchestrator_with(definition, options);
    let script = ScriptedHandler::new();

    let mut tx = orchestrator
        .begin_transaction("tx-archive", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Done);
    assert!(storage.get("orders:tx-archive").await?.is_none());
    let archived = storage.archived("orders:tx-archive").expect("archived");
    assert_eq!(archived.flow.state, FlowState::Done);
    Ok(())
}

#[tokio::test]
async fn fire_and_forget_mode_skips_checkpoints_and_rejects_async() -> anyhow::Result<()> {
    let options = ModelOptions {
        store_execution: false,
        ..ModelOptions::default()
    };

    // Async steps cannot work without checkpoints.
    let with_async = StepDefinition::root(vec![StepDefinition::action("a").async_invoke()]);
    let storage = Arc::new(MemoryStorage::new());
    assert!(Orchestrator::new("orders", with_async, options.clone(), storage.clone()).is_err());

    // A sync model runs fine and never touches storage.
    let definition = StepDefinition::root(vec![StepDefinition::action("a")]);
    let (orchestrator, storage) = orchestrator_with(definition, options);
    let script = ScriptedHandler::new();
    let mut tx = orchestrator
        .begin_transaction("tx-faf", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;
    assert_eq!(tx.flow.state, FlowState::Done);
    assert!(storage.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn terminal_step_states_respect_topology_invariants() -> anyhow::Result<()> {
    // A wide DAG with one failing branch: after rollback every reverted
    // step's descendants must themselves have finished compensating.
    let definition = StepDefinition::root(vec![
        StepDefinition::action("a").next(StepDefinition::action("b")),
        StepDefinition::action("c").next(StepDefinition::action("d")),
    ]);
    let (orchestrator, _storage) = orchestrator(definition);
    let script = ScriptedHandler::new();
    script.on_invoke("d", StepBehavior::FailPermanent("unrecoverable".into()));

    let mut tx = orchestrator
        .begin_transaction("tx-inv", script.handler(), serde_json::json!({}))
        .await?;
    orchestrator.resume(&mut tx).await?;

    assert_eq!(tx.flow.state, FlowState::Reverted);
    // Permanent bypass: exactly one attempt.
    assert_eq!(script.count("d", Phase::Invoke), 1);
    for id in ["_root.a", "_root.c", "_root.a.b"] {
        let step = tx.flow.step(id).unwrap();
        assert_eq!(step.compensate.state, StepState::Reverted, "step {id}");
        for child_id in &step.next {
            let child = tx.flow.step(child_id).unwrap();
            assert!(
                child.compensate.state.is_compensate_settled(),
                "child {child_id} still compensating"
            );
        }
    }
    Ok(())
}
