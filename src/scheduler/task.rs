use chrono::{Datelike, Days, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How far ahead [`ScheduledTask::next_run`] looks for a matching day.
pub const LOOKAHEAD_DAYS: u64 = 14;

/// What a scheduled task does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Gracefully stop running servers, then start them again
    DailyReboot,
    /// Gracefully stop running servers and leave them stopped
    MaintenanceShutdown,
    /// Back up every active server
    ScheduledBackup,
}

impl TaskKind {
    /// Name the operation lock is held under.
    pub fn operation_name(&self) -> &'static str {
        match self {
            TaskKind::DailyReboot => "scheduled reboot",
            TaskKind::MaintenanceShutdown => "maintenance shutdown",
            TaskKind::ScheduledBackup => "scheduled backup",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation_name())
    }
}

/// A recurring job at a fixed local time on selected weekdays.
///
/// `days` is indexed Monday first: `days[0]` is Monday, `days[6]` Sunday.
///
/// # Examples
///
/// ```
/// use chrono::{NaiveDate, NaiveTime};
/// use fleet_warden::scheduler::{ScheduledTask, TaskKind};
///
/// let task = ScheduledTask::new(
///     "nightly reboot",
///     TaskKind::DailyReboot,
///     NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
///     [true; 7],
/// );
/// // 2026-10-19 is a Monday.
/// let now = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap().and_hms_opt(5, 0, 0).unwrap();
/// let next = task.next_run(now).unwrap();
/// assert_eq!(next, NaiveDate::from_ymd_opt(2026, 10, 20).unwrap().and_hms_opt(4, 0, 0).unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub kind: TaskKind,
    pub time: NaiveTime,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub days: [bool; 7],
}

fn default_enabled() -> bool {
    true
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, kind: TaskKind, time: NaiveTime, days: [bool; 7]) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            time,
            enabled: true,
            days,
        }
    }

    /// The soonest instant strictly after `now` on an enabled day at `time`.
    ///
    /// `None` when the task is disabled or no enabled day falls within the
    /// next [`LOOKAHEAD_DAYS`] days.
    pub fn next_run(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.enabled {
            return None;
        }

        (0..=LOOKAHEAD_DAYS).find_map(|offset| {
            let date = now.date().checked_add_days(Days::new(offset))?;
            if !self.days[date.weekday().num_days_from_monday() as usize] {
                return None;
            }
            let at = date.and_time(self.time);
            (at > now).then_some(at)
        })
    }
}
