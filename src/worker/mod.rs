//! Background tasks
//!
//! Inbox handling and the timeline poller produce tasks; workers consume
//! them from the durable queue and perform the signed deliveries.

mod consumer;
mod errors;
mod handlers;
mod queue;
mod tasks;

pub use consumer::{Handler, Worker};
pub use errors::TaskError;
pub use handlers::TaskHandlers;
pub use queue::{QueueStats, QueuedTask, SqliteTaskQueue, TaskQueue};
pub use tasks::{
    DecodeError, FollowPayload, KIND_ACCEPT_FOLLOW, KIND_REJECT_FOLLOW, KIND_SEND_POST,
    SendPostPayload, Task, TaskOptions,
};
