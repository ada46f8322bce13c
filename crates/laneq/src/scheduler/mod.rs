//! Recurring jobs
//!
//! Cron definitions are persisted as schedule records; a [`CronScheduler`]
//! per process polls for due records and enqueues one instance per firing.

mod runner;
mod schedule;

pub use runner::{firing_id, schedule_record, CronScheduler, SchedulerConfig};
pub use schedule::{CronSchedule, ScheduleError};
