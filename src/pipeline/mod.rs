pub mod backpressure;
pub mod buffer;
pub mod channel;
pub mod runner;

pub use backpressure::{BackpressureHandler, Enqueued};
pub use buffer::{BufferError, BufferSlot, BufferStats, TweetBuffer};
pub use channel::{create_channel, Receiver, Sender};
pub use runner::{Bridge, PipelineError, RunningBridge, ShutdownReport};
