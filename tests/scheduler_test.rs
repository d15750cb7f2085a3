use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cumulus::actions::builtin::register_builtins;
use cumulus::actions::{TaskContext, TaskHandler};
use cumulus::flow::scheduler::TASK_TIMEOUT_REASON;
use cumulus::flow::{
    FailurePolicy, Flow, FlowBuilder, FlowScheduler, FlowStatus, FlowStore, InMemoryFlowStore,
    SchedulerOptions, TaskStatus, TemplateStep,
};
use cumulus::queue::{
    Arg, InMemoryResultBackend, InMemoryTaskQueue, QueueAdapter, ResultBackend, TaskQueue, Worker,
    WorkerOptions,
};
use cumulus::registry::TaskRegistry;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const NS: &str = "hcm";

/// Sleeps for `sleep_ms`, then fails if `fail` is set. Logs start/end events.
#[derive(Debug, Default)]
struct Step {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskHandler for Step {
    async fn execute(&self, _ctx: &TaskContext, args: Vec<Arg>) -> Result<Value> {
        let params = args.first().map(|a| a.value.clone()).unwrap_or(Value::Null);
        let key = params["key"].as_str().unwrap_or("?").to_string();
        self.events.lock().unwrap().push(format!("start:{key}"));
        let sleep_ms = params["sleep_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        self.events.lock().unwrap().push(format!("end:{key}"));
        if params["fail"].as_bool().unwrap_or(false) {
            return Err(anyhow!("{key} failed on purpose"));
        }
        Ok(json!({ "key": key }))
    }
}

/// Publishes a share value, or reads one back.
#[derive(Debug)]
struct Share;

#[async_trait]
impl TaskHandler for Share {
    async fn execute(&self, ctx: &TaskContext, args: Vec<Arg>) -> Result<Value> {
        let params = args.first().map(|a| a.value.clone()).unwrap_or(Value::Null);
        if let Some(value) = params["set"].as_str() {
            ctx.set_share("vpc_id", value);
        }
        Ok(json!({ "vpc_id": ctx.share("vpc_id"), "flow_id": ctx.flow_id }))
    }
}

struct Harness {
    store: Arc<InMemoryFlowStore>,
    scheduler: Arc<FlowScheduler>,
    step: Arc<Step>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn harness(policy: FailurePolicy, start_worker: bool) -> Harness {
    let registry = Arc::new(TaskRegistry::new());
    register_builtins(&registry, NS);
    let step = Arc::new(Step::default());
    registry.register(NS, "step", step.clone());
    registry.register(NS, "share", Arc::new(Share));

    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(256));
    let backend: Arc<dyn ResultBackend> = Arc::new(InMemoryResultBackend::new());
    let cancel = CancellationToken::new();
    if start_worker {
        let worker = Arc::new(Worker::new(
            "flow-worker",
            &registry,
            NS,
            queue.clone(),
            backend.clone(),
            WorkerOptions {
                concurrency: 8,
                ..Default::default()
            },
        ));
        tokio::spawn(worker.run(cancel.clone()));
    }

    let store = Arc::new(InMemoryFlowStore::new());
    let adapter = Arc::new(QueueAdapter::new(queue, backend, registry, NS));
    let options = SchedulerOptions {
        failure_policy: policy,
        dispatch_poll: Duration::from_millis(10),
        tick: Duration::from_millis(20),
    };
    let scheduler = Arc::new(FlowScheduler::new(store.clone(), adapter, options));
    Harness {
        store,
        scheduler,
        step,
        cancel,
    }
}

fn step(key: &str, sleep_ms: u64, fail: bool) -> TemplateStep {
    TemplateStep::new(key, "step").with_params(json!({"key": key, "sleep_ms": sleep_ms, "fail": fail}))
}

async fn build(h: &Harness, steps: Vec<TemplateStep>) -> Flow {
    FlowBuilder::new(h.store.clone())
        .build_from_steps("test-flow", steps, BTreeMap::new())
        .await
        .unwrap()
}

async fn run(h: &Harness, flow: &Flow) -> FlowStatus {
    tokio::time::timeout(Duration::from_secs(10), h.scheduler.run_flow(&flow.id, &h.cancel))
        .await
        .expect("flow did not finish")
        .unwrap()
}

async fn task_states(h: &Harness, flow: &Flow) -> Vec<(TaskStatus, Option<String>)> {
    let mut states = Vec::new();
    for id in &flow.task_ids {
        let task = h.store.get_task(id).await.unwrap().unwrap();
        states.push((task.state, task.reason));
    }
    states
}

#[tokio::test]
async fn test_independent_tasks_all_succeed() {
    let h = harness(FailurePolicy::FailFast, true);
    let flow = build(&h, vec![step("a", 30, false), step("b", 10, false), step("c", 0, false)]).await;

    assert_eq!(run(&h, &flow).await, FlowStatus::Success);
    let states = task_states(&h, &flow).await;
    assert!(states.iter().all(|(s, _)| *s == TaskStatus::Success));

    let stored = h.store.get_flow(&flow.id).await.unwrap().unwrap();
    assert_eq!(stored.state, FlowStatus::Success);
    assert!(stored.reason.is_none());
}

#[tokio::test]
async fn test_fail_fast_stops_dispatch_and_keeps_sibling_outcomes() {
    let h = harness(FailurePolicy::FailFast, true);
    let flow = build(
        &h,
        vec![
            step("slow1", 200, false),
            step("bad", 0, true),
            step("slow2", 200, false),
            step("after_slow1", 0, false).depends_on("slow1"),
        ],
    )
    .await;

    assert_eq!(run(&h, &flow).await, FlowStatus::Failed);

    let bad = h.store.get_task(&flow.task_ids[1]).await.unwrap().unwrap();
    assert_eq!(bad.state, TaskStatus::Failed);
    assert!(bad.reason.as_deref().unwrap().contains("bad failed on purpose"));

    // Siblings already in the queue ran to completion; their outcome is kept.
    for (i, key) in [(0, "slow1"), (2, "slow2")] {
        let sibling = h.store.get_task(&flow.task_ids[i]).await.unwrap().unwrap();
        assert_eq!(sibling.state, TaskStatus::Success, "{key}");
        assert_eq!(sibling.result, Some(json!({ "key": key })));
        assert!(sibling.reason.is_none());
    }

    // Nothing new is dispatched after the failure.
    let gated = h.store.get_task(&flow.task_ids[3]).await.unwrap().unwrap();
    assert_eq!(gated.state, TaskStatus::Pending);
    assert!(gated.instance_id.is_none());
    let events = h.step.events.lock().unwrap().clone();
    assert!(events.contains(&"end:slow1".to_string()));
    assert!(!events.iter().any(|e| e.ends_with(":after_slow1")));

    let stored = h.store.get_flow(&flow.id).await.unwrap().unwrap();
    assert_eq!(stored.state, FlowStatus::Failed);
    assert!(stored.reason.unwrap().contains("bad failed on purpose"));
}

#[tokio::test]
async fn test_continue_independent_runs_branches_to_completion() {
    let h = harness(FailurePolicy::ContinueIndependent, true);
    let flow = build(
        &h,
        vec![
            step("slow1", 100, false),
            step("bad", 0, true),
            step("slow2", 100, false),
            step("after_bad", 0, false).depends_on("bad"),
        ],
    )
    .await;

    assert_eq!(run(&h, &flow).await, FlowStatus::Failed);
    let states = task_states(&h, &flow).await;
    assert_eq!(states[0].0, TaskStatus::Success);
    assert_eq!(states[1].0, TaskStatus::Failed);
    assert_eq!(states[2].0, TaskStatus::Success);
    assert_eq!(states[3].0, TaskStatus::Pending);

    let gated = h.store.get_task(&flow.task_ids[3]).await.unwrap().unwrap();
    assert!(gated.instance_id.is_none(), "dependent of a failed task must never be dispatched");
    let events = h.step.events.lock().unwrap().clone();
    assert!(!events.iter().any(|e| e.ends_with(":after_bad")));
}

#[tokio::test]
async fn test_dependents_never_run_before_dependencies_succeed() {
    let h = harness(FailurePolicy::FailFast, true);
    let flow = build(
        &h,
        vec![
            step("a", 80, false),
            step("b", 60, false).depends_on("a"),
            step("c", 20, false).depends_on("a"),
            step("d", 0, false).depends_on("b").depends_on("c"),
        ],
    )
    .await;

    // Watch the store while the flow runs: a Running task must only ever
    // see Success dependencies.
    let store = h.store.clone();
    let watched = flow.clone();
    let watcher = tokio::spawn(async move {
        let mut violations = Vec::new();
        for _ in 0..400 {
            for id in &watched.task_ids {
                let task = store.get_task(id).await.unwrap().unwrap();
                if task.state != TaskStatus::Running {
                    continue;
                }
                for dep in &task.depend_on {
                    let dep_task = store.get_task(dep).await.unwrap().unwrap();
                    if dep_task.state != TaskStatus::Success {
                        violations.push((task.id.clone(), dep.clone()));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        violations
    });

    assert_eq!(run(&h, &flow).await, FlowStatus::Success);
    let violations = watcher.await.unwrap();
    assert!(violations.is_empty(), "gating violated: {violations:?}");

    let events = h.step.events.lock().unwrap().clone();
    let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
    assert!(pos("end:a") < pos("start:b"));
    assert!(pos("end:a") < pos("start:c"));
    assert!(pos("end:b") < pos("start:d"));
    assert!(pos("end:c") < pos("start:d"));
}

#[tokio::test]
async fn test_share_data_flows_between_tasks() {
    let h = harness(FailurePolicy::FailFast, true);
    let flow = build(
        &h,
        vec![
            TemplateStep::new("producer", "share").with_params(json!({"set": "vpc-123"})),
            TemplateStep::new("consumer", "share").depends_on("producer"),
        ],
    )
    .await;

    assert_eq!(run(&h, &flow).await, FlowStatus::Success);
    let consumer = h.store.get_task(&flow.task_ids[1]).await.unwrap().unwrap();
    assert_eq!(
        consumer.result,
        Some(json!({"vpc_id": "vpc-123", "flow_id": flow.id}))
    );
    let stored = h.store.get_flow(&flow.id).await.unwrap().unwrap();
    assert_eq!(stored.share_data["vpc_id"], "vpc-123");
}

#[tokio::test(start_paused = true)]
async fn test_unprocessed_task_times_out() {
    let h = harness(FailurePolicy::FailFast, false);
    let mut slow = TemplateStep::new("stuck", "echo");
    slow.timeout_secs = 30;
    let flow = build(&h, vec![slow]).await;

    let status = h.scheduler.run_flow(&flow.id, &h.cancel).await.unwrap();
    assert_eq!(status, FlowStatus::Failed);
    let states = task_states(&h, &flow).await;
    assert_eq!(states[0].1.as_deref(), Some(TASK_TIMEOUT_REASON));
}

#[tokio::test]
async fn test_unregistered_action_fails_the_task() {
    let h = harness(FailurePolicy::FailFast, true);
    let flow = build(&h, vec![TemplateStep::new("x", "no_such_action")]).await;

    assert_eq!(run(&h, &flow).await, FlowStatus::Failed);
    let states = task_states(&h, &flow).await;
    assert!(states[0].1.as_deref().unwrap().contains("no_such_action"));
}

#[tokio::test]
async fn test_watch_loop_drives_pending_flows() {
    let h = harness(FailurePolicy::FailFast, true);
    let first = build(&h, vec![step("one", 10, false)]).await;
    let second = build(&h, vec![step("two", 10, false), step("three", 0, false).depends_on("two")]).await;

    let watch = tokio::spawn(h.scheduler.clone().watch(h.cancel.clone()));
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let a = h.store.get_flow(&first.id).await.unwrap().unwrap();
            let b = h.store.get_flow(&second.id).await.unwrap().unwrap();
            if a.state.is_terminal() && b.state.is_terminal() {
                assert_eq!(a.state, FlowStatus::Success);
                assert_eq!(b.state, FlowStatus::Success);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    h.cancel.cancel();
    watch.await.unwrap().unwrap();
}
