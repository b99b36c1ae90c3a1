pub mod task;

pub use task::{NewTaskRequest, Task, TaskStatus, UnknownStatus, UpdateTaskRequest};
