use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cumulus::actions::builtin::register_builtins;
use cumulus::actions::{TaskContext, TaskHandler};
use cumulus::error::SubmissionError;
use cumulus::queue::{
    Arg, CallbackPolicy, InMemoryResultBackend, InMemoryTaskQueue, QueueAdapter, ResultBackend,
    Signature, SignatureState, SignatureStatus, SubmitRequest, TaskQueue, TaskType, Worker,
    WorkerOptions,
};
use cumulus::registry::TaskRegistry;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const NS: &str = "hcm";

#[derive(Debug)]
struct AlwaysFail;

#[async_trait]
impl TaskHandler for AlwaysFail {
    async fn execute(&self, _ctx: &TaskContext, _args: Vec<Arg>) -> Result<Value> {
        Err(anyhow!("boom"))
    }
}

/// Fails until the given attempt, then returns the attempt number.
#[derive(Debug)]
struct Flaky {
    succeed_on: u32,
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn execute(&self, ctx: &TaskContext, _args: Vec<Arg>) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt < self.succeed_on {
            return Err(anyhow!("transient failure on attempt {}", ctx.attempt));
        }
        Ok(json!(ctx.attempt))
    }
}

struct Harness {
    adapter: QueueAdapter,
    queue: Arc<InMemoryTaskQueue>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn registry() -> Arc<TaskRegistry> {
    let registry = Arc::new(TaskRegistry::new());
    register_builtins(&registry, NS);
    registry.register(NS, "fail", Arc::new(AlwaysFail));
    registry
}

fn harness_with(registry: Arc<TaskRegistry>, policy: CallbackPolicy, start_worker: bool) -> Harness {
    let queue = Arc::new(InMemoryTaskQueue::new(256));
    let backend = Arc::new(InMemoryResultBackend::new());
    let cancel = CancellationToken::new();

    if start_worker {
        let options = WorkerOptions {
            concurrency: 4,
            task_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(10),
            callback_policy: policy,
        };
        let worker = Arc::new(Worker::new(
            "test-worker",
            &registry,
            NS,
            queue.clone() as Arc<dyn TaskQueue>,
            backend.clone() as Arc<dyn ResultBackend>,
            options,
        ));
        tokio::spawn(worker.run(cancel.clone()));
    }

    let adapter = QueueAdapter::new(queue.clone(), backend, registry, NS);
    Harness {
        adapter,
        queue,
        cancel,
    }
}

fn harness(policy: CallbackPolicy) -> Harness {
    harness_with(registry(), policy, true)
}

async fn wait_terminal(adapter: &QueueAdapter, id: &str) -> SignatureState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(state) = adapter.task_state(id).await.unwrap() {
                if state.is_terminal() {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not reach a terminal state")
}

fn echo(value: Value) -> Signature {
    Signature::new("echo", vec![Arg::json(value)])
}

fn with_id(mut sig: Signature, id: &str) -> Signature {
    sig.uuid = id.to_string();
    sig
}

#[tokio::test]
async fn test_single_task_round_trip() {
    let h = harness(CallbackPolicy::default());
    let id = h.adapter.send_task(echo(json!({"vpc": "vpc-1"}))).await.unwrap();
    assert!(id.starts_with("task_"));

    let state = wait_terminal(&h.adapter, &id).await;
    assert_eq!(state.state, SignatureStatus::Success);
    assert_eq!(state.result, Some(json!({"vpc": "vpc-1"})));
    assert_eq!(state.attempts, 1);
}

#[tokio::test]
async fn test_chain_halts_on_failing_step() {
    let h = harness(CallbackPolicy::default());
    let steps = vec![
        with_id(echo(json!("a")), "task_a"),
        with_id(Signature::new("fail", vec![]), "task_b"),
        with_id(echo(json!("c")), "task_c"),
    ];
    let head = h.adapter.send_chain(steps).await.unwrap();
    assert_eq!(head, "task_a");

    let b = wait_terminal(&h.adapter, "task_b").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ids = vec!["task_a".to_string(), "task_b".to_string(), "task_c".to_string()];
    let states = h.adapter.chain_states(&ids).await.unwrap();
    assert_eq!(states[0].as_ref().unwrap().state, SignatureStatus::Success);
    assert_eq!(b.state, SignatureStatus::Failure);
    assert!(b.error.as_deref().unwrap().contains("boom"));
    assert!(states[2].is_none(), "step after the failure must never run");
}

#[tokio::test]
async fn test_chain_passes_result_forward() {
    let h = harness(CallbackPolicy::default());
    let steps = vec![
        with_id(echo(json!({"n": 1})), "task_first"),
        with_id(Signature::new("echo", vec![]), "task_second"),
    ];
    h.adapter.send_chain(steps).await.unwrap();

    let second = wait_terminal(&h.adapter, "task_second").await;
    assert_eq!(second.state, SignatureStatus::Success);
    assert_eq!(second.result, Some(json!({"n": 1})));
}

#[tokio::test]
async fn test_chain_ids_cover_every_step() {
    let h = harness(CallbackPolicy::default());
    let chain: SubmitRequest = serde_json::from_value(json!({
        "task_type": "chain",
        "steps": [
            {"task_name": "echo", "args": [{"type": "string", "value": "a"}]},
            {"task_name": "fail"},
            {"task_name": "echo", "args": [{"type": "string", "value": "c"}]}
        ]
    }))
    .unwrap();
    let response = h.adapter.submit(chain).await.unwrap();
    let ids = response.chain_ids.clone();
    assert_eq!(ids.len(), 3);
    assert_eq!(response.task_id.as_deref(), Some(ids[0].as_str()));

    wait_terminal(&h.adapter, &ids[1]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let states = h.adapter.chain_states(&ids).await.unwrap();
    assert_eq!(states[0].as_ref().unwrap().state, SignatureStatus::Success);
    assert_eq!(states[1].as_ref().unwrap().state, SignatureStatus::Failure);
    assert!(states[2].is_none());
}

#[tokio::test]
async fn test_immutable_step_ignores_parent_result() {
    let h = harness(CallbackPolicy::default());
    let steps = vec![
        with_id(echo(json!("parent")), "task_p"),
        with_id(echo(json!("own")).immutable(), "task_child"),
    ];
    h.adapter.send_chain(steps).await.unwrap();

    let child = wait_terminal(&h.adapter, "task_child").await;
    assert_eq!(child.result, Some(json!("own")));
}

#[tokio::test]
async fn test_on_error_branches_get_fresh_ids() {
    let h = harness(CallbackPolicy::default());
    let cleanup = with_id(Signature::new("echo", vec![]), "template_cleanup");
    let sig = Signature::new("fail", vec![]).on_error(cleanup.clone()).on_error(cleanup);
    let id = h.adapter.send_task(sig).await.unwrap();
    let failed = wait_terminal(&h.adapter, &id).await;
    assert_eq!(failed.state, SignatureStatus::Failure);

    // Branch copies run under fresh ids, never the template's.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.adapter.task_state("template_cleanup").await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_budget_is_consumed() {
    let registry = registry();
    let flaky = Arc::new(Flaky {
        succeed_on: 3,
        calls: AtomicU32::new(0),
    });
    registry.register(NS, "flaky", flaky.clone());
    let h = harness_with(registry, CallbackPolicy::default(), true);

    let id = h
        .adapter
        .send_task(Signature::new("flaky", vec![]).with_retry(2))
        .await
        .unwrap();
    let state = wait_terminal(&h.adapter, &id).await;
    assert_eq!(state.state, SignatureStatus::Success);
    assert_eq!(state.result, Some(json!(3)));
    assert_eq!(state.attempts, 3);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let id = h
        .adapter
        .send_task(Signature::new("flaky", vec![]).with_retry(0))
        .await
        .unwrap();
    let state = wait_terminal(&h.adapter, &id).await;
    assert_eq!(state.state, SignatureStatus::Failure);
}

#[tokio::test]
async fn test_group_states() {
    let h = harness(CallbackPolicy::default());
    let group_id = h
        .adapter
        .send_group(vec![echo(json!(1)), echo(json!(2)), Signature::new("fail", vec![])])
        .await
        .unwrap();
    assert!(group_id.starts_with("group_"));

    let states = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let states = h.adapter.group_states(&group_id, 3).await.unwrap();
            if states.iter().all(|s| s.is_terminal()) {
                return states;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let succeeded = states.iter().filter(|s| s.state == SignatureStatus::Success).count();
    assert_eq!(succeeded, 2);
    assert!(h.adapter.group_states(&group_id, 4).await.is_err());
    assert!(h.adapter.group_states("group_missing", 3).await.is_err());
}

async fn run_chord(policy: CallbackPolicy, members: Vec<Signature>) -> (Harness, String, String) {
    let h = harness(policy);
    let handle = h
        .adapter
        .send_chord(members, Signature::new("echo", vec![]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let chord = h
                .adapter
                .chord_states(&handle.group_id, &handle.callback_id)
                .await
                .unwrap();
            if chord.members.iter().all(|s| s.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    (h, handle.group_id, handle.callback_id)
}

#[tokio::test]
async fn test_chord_callback_gets_member_results() {
    let (h, group_id, callback_id) =
        run_chord(CallbackPolicy::AllSucceeded, vec![echo(json!("x")), echo(json!("x"))]).await;
    let chord = h.adapter.chord_states(&group_id, &callback_id).await.unwrap();
    let callback = chord.callback.expect("callback should have run");
    assert_eq!(callback.state, SignatureStatus::Success);
    assert_eq!(callback.result, Some(json!(["x", "x"])));
}

#[tokio::test]
async fn test_chord_callback_skipped_after_failure() {
    let (h, group_id, callback_id) = run_chord(
        CallbackPolicy::AllSucceeded,
        vec![echo(json!("x")), Signature::new("fail", vec![])],
    )
    .await;
    let chord = h.adapter.chord_states(&group_id, &callback_id).await.unwrap();
    assert!(chord.callback.is_none());
}

#[tokio::test]
async fn test_chord_callback_runs_when_all_terminal() {
    let (h, group_id, callback_id) = run_chord(
        CallbackPolicy::AllTerminal,
        vec![echo(json!("x")), Signature::new("fail", vec![])],
    )
    .await;
    let chord = h.adapter.chord_states(&group_id, &callback_id).await.unwrap();
    let callback = chord.callback.expect("callback should have run");
    let results = callback.result.unwrap();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.contains(&json!("x")));
    assert!(results.contains(&Value::Null));
}

async fn assert_nothing_enqueued(h: &Harness) {
    let popped = tokio::time::timeout(Duration::from_millis(50), h.queue.pop()).await;
    assert!(popped.is_err(), "rejected submission must not enqueue anything");
}

#[tokio::test]
async fn test_rejected_submissions_enqueue_nothing() {
    let h = harness_with(registry(), CallbackPolicy::default(), false);

    let err = h
        .adapter
        .send_group(vec![echo(json!(1)), Signature::new("not_registered", vec![])])
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::UnregisteredTask { ref name, .. } if name == "not_registered"));
    assert_nothing_enqueued(&h).await;

    let err = h
        .adapter
        .send_task(Signature::new("http", vec![Arg::json(json!({"method": "GET"}))]))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::InvalidArguments { .. }));
    assert_nothing_enqueued(&h).await;

    let err = h.adapter.send_chain(vec![]).await.unwrap_err();
    assert!(matches!(err, SubmissionError::EmptySteps));

    let err = h
        .adapter
        .send_task(Signature::new("echo", vec![Arg::new("", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::MissingArgument { .. }));
    assert_nothing_enqueued(&h).await;
}

#[tokio::test]
async fn test_submit_request_dispatch() {
    let h = harness(CallbackPolicy::default());

    let single: SubmitRequest = serde_json::from_value(json!({
        "task_type": "single",
        "steps": [{"task_name": "echo", "args": [{"type": "string", "value": "hi"}]}]
    }))
    .unwrap();
    let response = h.adapter.submit(single).await.unwrap();
    assert_eq!(response.task_type, TaskType::Single);
    assert!(response.group_id.is_none());
    let state = wait_terminal(&h.adapter, response.task_id.as_deref().unwrap()).await;
    assert_eq!(state.result, Some(json!("hi")));

    let chord: SubmitRequest = serde_json::from_value(json!({
        "task_type": "chord",
        "steps": [{"task_name": "echo"}, {"task_name": "echo"}],
        "callback_task": {"task_name": "log"}
    }))
    .unwrap();
    let response = h.adapter.submit(chord).await.unwrap();
    assert!(response.task_id.is_none());
    assert!(response.group_id.is_some());

    let cron = SubmitRequest {
        task_type: TaskType::Cron,
        steps: vec![echo(json!(1))],
        callback_task: None,
    };
    assert!(matches!(
        h.adapter.submit(cron).await,
        Err(SubmissionError::Unsupported(TaskType::Cron))
    ));
}
