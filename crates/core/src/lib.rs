pub mod domain;
pub mod error;

pub use domain::board::{Board, BoardMeta};
pub use domain::task::{CreateTaskRequest, Priority, Task, TaskStatus, UpdateTaskRequest};
pub use domain::workflow::{Stage, WorkflowStep};
pub use error::CoreError;
