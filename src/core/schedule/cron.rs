use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::core::errors::{OrchResult, OrchestratorError};

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed five-field cron expression (`minute hour day-of-month month
/// day-of-week`) with standard day-of-week numbering, 0 and 7 both Sunday.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: ::cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> OrchResult<Self> {
        let invalid = |msg: String| {
            OrchestratorError::InvalidInput(format!("invalid cron expression '{}': {}", expr, msg))
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        }
        let dow = translate_day_of_week(fields[4]).map_err(invalid)?;
        let six_field = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], dow
        );
        let schedule = ::cron::Schedule::from_str(&six_field).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            source: fields.join(" "),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Earliest matching instant strictly after `after`, with wall-clock
    /// fields read in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Rewrites a standard day-of-week field into the evaluator's numbering
/// (1-7, Sunday = 1) as an explicit list.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, step)
            }
            None => (item, 1),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_number(a)?, day_number(b)?)
        } else {
            let day = day_number(range)?;
            // `5/2` means "from Friday, every second day".
            (day, if item.contains('/') { 6 } else { day })
        };
        if start > end {
            return Err(format!("day-of-week range '{}' runs backwards", range));
        }
        let mut day = start;
        while day <= end {
            days.insert(day % 7);
            day += step;
        }
    }
    if days.is_empty() {
        return Err(format!("day-of-week '{}' matches nothing", field));
    }
    Ok(days
        .iter()
        .map(|d| (d + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

fn day_number(raw: &str) -> Result<u32, String> {
    if let Ok(n) = raw.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {} out of range 0-7", n))
        };
    }
    let lower = raw.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|d| lower.starts_with(d))
        .map(|p| p as u32)
        .ok_or_else(|| format!("unknown day-of-week '{}'", raw))
}
