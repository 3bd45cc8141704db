pub mod attempt;
pub mod events;
pub mod tracker;

pub use attempt::{AttemptState, PublishAttempt};
pub use events::{EventSink, PipelineEvent, PipelineStats, StatsSnapshot};
pub use tracker::{
    AbandonReason, AbandonedRecord, DeliveryTracker, DeliveryUpdate, TrackerReport, TrackerTask,
};
