//! Time-driven operations.
//!
//! Two kinds of triggers live here. Calendar tasks fire at a local time on
//! selected weekdays through the [`CalendarDispatcher`]; backups and update
//! checks fire on a fixed interval through [`RearmingTimer`]s. Both only
//! start work after taking the fleet's [`OperationLock`](crate::OperationLock).
mod calendar;
mod clock;
mod periodic;
mod task;

pub use calendar::{CalendarDispatcher, Dispatch, Slot, TaskRunner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use periodic::{PeriodicJob, RearmingTimer};
pub use task::{LOOKAHEAD_DAYS, ScheduledTask, TaskKind};
