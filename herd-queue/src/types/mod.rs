pub mod ids;
pub mod clock;
pub mod options;
pub mod message;
pub mod record;
pub mod priority;
pub mod stats;
pub mod events;

pub use ids::{JobId, WorkerId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use options::{Backoff, EnqueueOptions, JobDefaults, Retention};
pub use message::{EnqueueRequest, JobMessage};
pub use record::{JobRecord, JobState};
pub use priority::JobPriority;
pub use stats::QueueStats;
pub use events::JobEvent;
