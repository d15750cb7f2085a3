use anyhow::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use crate::queue::signature::{Signature, SignatureState};

// --- Interfaces ---

/// Work queue shared by submitters and workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, sig: Signature) -> Result<()>;
    /// Next signature, or `None` if nothing arrived within the backend's poll window.
    async fn pop(&self) -> Result<Option<Signature>>;
}

/// Where workers record instance state and submitters read it back.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn set_state(&self, state: SignatureState) -> Result<()>;
    async fn get_state(&self, task_uuid: &str) -> Result<Option<SignatureState>>;

    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> Result<()>;
    async fn group_members(&self, group_uuid: &str) -> Result<Option<Vec<String>>>;

    /// Marks the chord of `group_uuid` as fired. Returns `true` to exactly one caller.
    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool>;
}

// --- In-Memory Implementations ---

pub struct InMemoryTaskQueue {
    sender: mpsc::Sender<Signature>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Signature>>,
}

impl InMemoryTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: tx,
            receiver: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, sig: Signature) -> Result<()> {
        self.sender
            .send(sig)
            .await
            .map_err(|e| anyhow::anyhow!("Task channel closed: {}", e))
    }

    async fn pop(&self) -> Result<Option<Signature>> {
        let mut rx = self.receiver.lock().await;
        Ok(rx.recv().await)
    }
}

#[derive(Default)]
pub struct InMemoryResultBackend {
    states: DashMap<String, SignatureState>,
    groups: DashMap<String, Vec<String>>,
    fired_chords: DashSet<String>,
}

impl InMemoryResultBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    async fn set_state(&self, state: SignatureState) -> Result<()> {
        self.states.insert(state.task_uuid.clone(), state);
        Ok(())
    }

    async fn get_state(&self, task_uuid: &str) -> Result<Option<SignatureState>> {
        Ok(self.states.get(task_uuid).map(|s| s.value().clone()))
    }

    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> Result<()> {
        self.groups.insert(group_uuid.to_string(), task_uuids.to_vec());
        Ok(())
    }

    async fn group_members(&self, group_uuid: &str) -> Result<Option<Vec<String>>> {
        Ok(self.groups.get(group_uuid).map(|m| m.value().clone()))
    }

    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool> {
        Ok(self.fired_chords.insert(group_uuid.to_string()))
    }
}
