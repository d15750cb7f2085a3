pub mod model;
pub mod store;
pub mod redis_store;
pub mod template;
pub mod builder;
pub mod scheduler;

pub use builder::FlowBuilder;
pub use model::{Flow, FlowStatus, SubTask, Task, TaskStatus};
pub use scheduler::{FailurePolicy, FlowScheduler, SchedulerOptions};
pub use store::{FlowFilter, FlowStore, InMemoryFlowStore, MAX_PAGE_LIMIT, Page, TaskFilter};
pub use template::{ActionParam, FlowTemplate, ParamOverrides, TemplateStep, load_template_from_yaml};
