//! Admission decisions, pacing and their building blocks.

mod acquirer;
mod backoff;
mod bucket;
pub mod clock;
mod distributed;
mod keyed;
mod keyer;
mod logging;
mod waiter;

pub use acquirer::Acquirer;
pub use backoff::ConflictBackoff;
pub use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedAdmitter, DistributedConfig};
pub use keyed::KeyedLocalAdmitter;
pub use keyer::{IntervalKey, IntervalKeyer, Keyer};
pub use logging::LoggingAcquirer;
pub use waiter::{NextIntervalWaiter, Waiter};
