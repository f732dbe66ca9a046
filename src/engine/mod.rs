pub mod batching;
pub mod dispatch;
pub mod queue;
