//! Trigger evaluator (C4)
//!
//! A stateless predicate over a task and the current time. Never panics and
//! never blocks: malformed cron expressions simply evaluate to "not due"
//! rather than erroring out the driver loop that calls this on every tick.

use chrono::{DateTime, Datelike, Timelike, Utc};
use shared::model::{Task, TriggerType};

/// Is `task` due to run at `now`?
pub fn is_due(task: &Task, now: DateTime<Utc>) -> bool {
    match task.trigger_type {
        TriggerType::Now => true,
        TriggerType::Once => match task.scheduled_at {
            Some(scheduled_at) => now >= scheduled_at,
            None => false,
        },
        TriggerType::Interval => match task.interval_seconds {
            Some(interval_seconds) => match task.last_run {
                None => true,
                Some(last_run) => {
                    now.signed_duration_since(last_run).num_seconds() >= interval_seconds as i64
                }
            },
            None => false,
        },
        TriggerType::Cron => match &task.cron_expression {
            Some(expr) => match next_fire_at_or_after(expr, now) {
                Some(next_fire) => {
                    let not_yet_run_this_window =
                        task.last_run.map(|last_run| last_run < next_fire).unwrap_or(true);
                    now >= next_fire && not_yet_run_this_window
                }
                None => false,
            },
            None => false,
        },
        // Event-triggered tasks are never due here; the event watcher (C7)
        // fires them directly when the watched condition occurs.
        TriggerType::Event => false,
    }
}

/// A parsed cron subset: minute, hour, weekday. Day-of-month and month are
/// always wildcarded, matching the field table this type was built against.
struct CronFields {
    minute: CronField,
    hour: CronField,
    weekday: CronField,
}

enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

fn parse_field(raw: &str, max: u32) -> Option<CronField> {
    if raw == "*" {
        return Some(CronField::Any);
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        let value: u32 = part.parse().ok()?;
        if value > max {
            return None;
        }
        values.push(value);
    }
    if values.is_empty() {
        return None;
    }
    Some(CronField::Values(values))
}

/// Parse a 5-field cron expression, keeping only minute/hour/weekday and
/// requiring (but ignoring) day-of-month and month to be present.
fn parse_cron(expr: &str) -> Option<CronFields> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    let minute = parse_field(fields[0], 59)?;
    let hour = parse_field(fields[1], 23)?;
    // fields[2] (day-of-month) and fields[3] (month) are required to be
    // present but are never consulted.
    let weekday = parse_field(fields[4], 6)?;
    Some(CronFields { minute, hour, weekday })
}

/// Walk forward minute-by-minute from `now` (truncated to the minute) to find
/// the next time at or after `now` matching the cron fields. Bounded to two
/// years out so a pathological expression (no field ever matches, which
/// cannot actually happen given the parsed ranges) cannot loop forever.
fn next_fire_at_or_after(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let fields = parse_cron(expr)?;
    let start = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))?;

    const MAX_MINUTES: i64 = 60 * 24 * 366 * 2;
    let mut candidate = start;
    for _ in 0..MAX_MINUTES {
        let weekday = candidate.weekday().num_days_from_sunday();
        if fields.minute.matches(candidate.minute())
            && fields.hour.matches(candidate.hour())
            && fields.weekday.matches(weekday)
        {
            return Some(candidate);
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared::model::{EventTrigger, ScriptType, TargetType, TaskStatus};
    use uuid::Uuid;

    fn base_task() -> Task {
        Task {
            task_id: Uuid::new_v4(),
            name: "t".to_string(),
            script_type: ScriptType::Bash,
            script_body: "true".to_string(),
            trigger_type: TriggerType::Now,
            scheduled_at: None,
            interval_seconds: None,
            cron_expression: None,
            event_trigger: None,
            target_type: TargetType::All,
            target_id: None,
            status: TaskStatus::Pending,
            cancelled: false,
            last_run: None,
        }
    }

    #[test]
    fn now_trigger_is_always_due() {
        let task = base_task();
        assert!(is_due(&task, Utc::now()));
    }

    #[test]
    fn once_trigger_due_only_after_scheduled_time() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Once;
        let scheduled = Utc.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap();
        task.scheduled_at = Some(scheduled);

        assert!(!is_due(&task, scheduled - chrono::Duration::minutes(1)));
        assert!(is_due(&task, scheduled));
        assert!(is_due(&task, scheduled + chrono::Duration::minutes(1)));
    }

    #[test]
    fn once_trigger_missing_scheduled_at_is_never_due() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Once;
        assert!(!is_due(&task, Utc::now()));
    }

    #[test]
    fn interval_trigger_due_on_first_run() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Interval;
        task.interval_seconds = Some(3600);
        assert!(is_due(&task, Utc::now()));
    }

    #[test]
    fn interval_trigger_respects_elapsed_time() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Interval;
        task.interval_seconds = Some(3600);
        let now = Utc::now();
        task.last_run = Some(now - chrono::Duration::minutes(30));
        assert!(!is_due(&task, now));

        task.last_run = Some(now - chrono::Duration::hours(2));
        assert!(is_due(&task, now));
    }

    #[test]
    fn cron_trigger_fires_at_matching_minute_hour_weekday() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Cron;
        // Every day at 09:30.
        task.cron_expression = Some("30 9 * * *".to_string());

        let before = Utc.with_ymd_and_hms(2026, 7, 29, 9, 29, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 7, 29, 9, 30, 0).unwrap();
        assert!(!is_due(&task, before));
        assert!(is_due(&task, at));
    }

    #[test]
    fn cron_trigger_does_not_refire_same_window_after_last_run() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Cron;
        task.cron_expression = Some("30 9 * * *".to_string());
        let at = Utc.with_ymd_and_hms(2026, 7, 29, 9, 35, 0).unwrap();
        task.last_run = Some(Utc.with_ymd_and_hms(2026, 7, 29, 9, 30, 0).unwrap());
        assert!(!is_due(&task, at));
    }

    #[test]
    fn cron_trigger_respects_weekday_field() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Cron;
        // Weekday 1 = Monday. 2026-07-29 is a Wednesday (weekday 3).
        task.cron_expression = Some("0 0 * * 1".to_string());
        let wednesday_midnight = Utc.with_ymd_and_hms(2026, 7, 29, 0, 0, 0).unwrap();
        assert!(!is_due(&task, wednesday_midnight));
    }

    #[test]
    fn malformed_cron_expression_is_never_due() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Cron;
        task.cron_expression = Some("not a cron expression".to_string());
        assert!(!is_due(&task, Utc::now()));

        task.cron_expression = Some("* * *".to_string());
        assert!(!is_due(&task, Utc::now()));

        task.cron_expression = Some("61 * * * *".to_string());
        assert!(!is_due(&task, Utc::now()));
    }

    #[test]
    fn event_trigger_is_never_due_here() {
        let mut task = base_task();
        task.trigger_type = TriggerType::Event;
        task.event_trigger = Some(EventTrigger::NetworkChange);
        assert!(!is_due(&task, Utc::now()));
    }
}
