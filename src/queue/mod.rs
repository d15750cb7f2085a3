pub mod signature;
pub mod broker;
pub mod redis_broker;
pub mod adapter;
pub mod worker;

pub use adapter::{ChordHandle, ChordState, QueueAdapter};
pub use broker::{InMemoryResultBackend, InMemoryTaskQueue, ResultBackend, TaskQueue};
pub use signature::{Arg, Signature, SignatureState, SignatureStatus, SubmitRequest, SubmitResponse, TaskType};
pub use worker::{CallbackPolicy, Worker, WorkerOptions};
