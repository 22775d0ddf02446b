mod board;
mod health;
pub mod logs;
pub mod sse;
mod tasks;
mod workflow;
mod workspaces;

pub use board::*;
pub use health::*;
pub use tasks::*;
pub use workflow::*;
pub use workspaces::*;
