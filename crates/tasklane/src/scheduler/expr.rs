//! Five-field cron expressions.
//!
//! Expressions use the classic `minute hour day-of-month month day-of-week`
//! layout with Sunday as 0 (or 7). When both day fields are restricted a time
//! matches if either of them does, as in Vixie cron. They are evaluated in
//! local time.

use chrono::{DateTime, Local, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression.
#[derive(Clone, Debug)]
pub struct CronExpr {
    source: String,
    /// One schedule, or two (day-of-month and day-of-week) whose union is the expression.
    schedules: Vec<cron::Schedule>,
}

impl CronExpr {
    /// # Errors
    /// - `E_INVALID_CRON`: wrong field count or a field the parser rejects
    pub fn parse(expr: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            return Err(EngineError::invalid_cron(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        };
        let either_day = is_restricted(day_of_month) && is_restricted(day_of_week);
        let day_of_week = translate_day_of_week(day_of_week)
            .map_err(|reason| EngineError::invalid_cron(expr, reason))?;
        let day_pairs = if either_day {
            vec![(*day_of_month, "*"), ("*", day_of_week.as_str())]
        } else {
            vec![(*day_of_month, day_of_week.as_str())]
        };
        let schedules = day_pairs
            .into_iter()
            .map(|(dom, dow)| {
                // The parser wants a leading seconds field.
                let expanded = format!("0 {minute} {hour} {dom} {month} {dow}");
                cron::Schedule::from_str(&expanded)
                    .map_err(|err| EngineError::invalid_cron(expr, err))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            source: fields.join(" "),
            schedules,
        })
    }

    /// The normalized five-field source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, in `after`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }

    /// Next fire time after `now`, evaluated on the local clock.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after(&now.with_timezone(&Local))
            .map(|at| at.with_timezone(&Utc))
    }

    /// Up to `count` fire times after `now`, evaluated on the local clock.
    pub fn upcoming(&self, now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let first = self.next_after(&now.with_timezone(&Local));
        std::iter::successors(first, |at| self.next_after(at))
            .take(count)
            .map(|at| at.with_timezone(&Utc))
            .collect()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `*` and `?` leave a day field unrestricted, with or without a step.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

/// Rewrite a numeric day-of-week field (Sunday = 0 or 7) as an explicit list
/// of day names. Fields that use names are passed through.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    if field.bytes().any(|b| b.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }
    let mut days = [false; 7];
    for item in field.split(',') {
        for day in expand_day_item(item)? {
            if let Some(slot) = days.get_mut(day % 7) {
                *slot = true;
            }
        }
    }
    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Ok(names.join(","))
}

/// Values 0..=7 selected by one comma-separated item such as `5`, `1-7`, `*/2` or `1-5/2`.
fn expand_day_item(item: &str) -> Result<Vec<usize>, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let step = match step {
        Some(step) => match step.parse::<usize>() {
            Ok(step) if step > 0 => step,
            _ => return Err(format!("invalid day-of-week step '{step}'")),
        },
        None => 1,
    };
    let (start, end) = match range.split_once('-') {
        _ if range == "*" => (0, 6),
        Some((start, end)) => (day_number(start)?, day_number(end)?),
        // `N/step` runs to the end of the week.
        None if item.contains('/') => (day_number(range)?, 6),
        None => {
            let day = day_number(range)?;
            (day, day)
        }
    };
    if start > end {
        return Err(format!("day-of-week range '{range}' is backwards"));
    }
    Ok((start..=end).step_by(step).collect())
}

fn day_number(token: &str) -> Result<usize, String> {
    token
        .parse::<usize>()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("day-of-week value {token} is out of range 0-7"))
}

/// Next fire time of `expr` from the current instant.
pub fn next_run_time(expr: &str) -> EngineResult<DateTime<Utc>> {
    next_run_after(expr, Utc::now())
}

/// Next fire time of `expr` strictly after `now`.
///
/// # Errors
/// - `E_INVALID_CRON`: unparsable, or the expression never fires
pub fn next_run_after(expr: &str, now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
    CronExpr::parse(expr)?
        .next_fire(now)
        .ok_or_else(|| EngineError::invalid_cron(expr, "expression never fires"))
}

/// Up to `count` upcoming fire times of `expr` after `now`.
pub fn upcoming(expr: &str, now: DateTime<Utc>, count: usize) -> EngineResult<Vec<DateTime<Utc>>> {
    Ok(CronExpr::parse(expr)?.upcoming(now, count))
}
