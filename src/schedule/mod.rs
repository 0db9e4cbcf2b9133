//! Scheduled "send later" dispatch.

mod dispatcher;
mod job;

pub use dispatcher::ScheduledDispatcher;
pub use job::{JobStore, Owner, PostPayload, PostReceipt, PostSender, ScheduledJob};
