mod parse;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub use parse::parse_world_date;

/// A campaign world's calendar. All arithmetic derives from `days_per_month`;
/// nothing in the core assumes a 365-day year.
///
/// Timestamps are stored as UTC instants and the month/day grid maps onto the
/// timestamp's UTC fields, so formatted strings round-trip with
/// [`parse_world_date`] exactly.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Calendar {
    pub id: Uuid,
    pub name: String,
    pub months_per_year: usize,
    pub days_per_month: Vec<u32>,
    pub month_names: Vec<String>,
    /// Earliest representable world date, ISO 8601.
    pub epoch: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The timestamp grid caps month length; a calendar month cannot exceed it.
const MAX_DAYS_IN_MONTH: u32 = 31;
/// Months beyond the twelfth cannot be addressed on the timestamp grid.
const MAX_MONTHS_PER_YEAR: usize = 12;

impl Calendar {
    pub fn days_in_year(&self) -> u32 {
        self.days_per_month.iter().sum()
    }

    pub fn days_in_month(&self, month: usize) -> Option<u32> {
        self.days_per_month.get(month).copied()
    }

    /// Case-insensitive month lookup, returning the zero-based index.
    pub fn month_index(&self, name: &str) -> Option<usize> {
        self.month_names
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(name))
    }

    pub fn month_name(&self, month: usize) -> Option<&str> {
        self.month_names.get(month).map(String::as_str)
    }

    /// Structural soundness of the definition itself.
    pub fn check_definition(&self) -> CoreResult<()> {
        if self.months_per_year == 0 {
            return Err(CoreError::validation("calendar must have at least one month"));
        }
        if self.months_per_year > MAX_MONTHS_PER_YEAR {
            return Err(CoreError::validation(format!(
                "calendar has {} months; at most {MAX_MONTHS_PER_YEAR} are supported",
                self.months_per_year
            )));
        }
        if self.days_per_month.len() != self.months_per_year
            || self.month_names.len() != self.months_per_year
        {
            return Err(CoreError::validation(format!(
                "calendar declares {} months but lists {} day counts and {} names",
                self.months_per_year,
                self.days_per_month.len(),
                self.month_names.len()
            )));
        }
        if let Some(days) = self
            .days_per_month
            .iter()
            .find(|days| **days == 0 || **days > MAX_DAYS_IN_MONTH)
        {
            return Err(CoreError::validation(format!(
                "month length {days} is outside 1..={MAX_DAYS_IN_MONTH}"
            )));
        }
        Ok(())
    }
}

/// Outcome of [`validate_world_date`]. Kept as data rather than an error so
/// callers can surface it without unwinding.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateValidation {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DateValidation {
    fn ok() -> Self {
        DateValidation {
            is_valid: true,
            error: None,
        }
    }

    fn invalid(error: impl Into<String>) -> Self {
        DateValidation {
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

/// Checks a world date against a calendar: not before the epoch, month within
/// the year, day within the month. Without a calendar, any timestamp passes.
pub fn validate_world_date(date: DateTime<Utc>, calendar: Option<&Calendar>) -> DateValidation {
    let calendar = match calendar {
        Some(calendar) => calendar,
        None => return DateValidation::ok(),
    };

    if date < calendar.epoch {
        return DateValidation::invalid(format!(
            "date {} is before the calendar epoch {}",
            date.to_rfc3339(),
            calendar.epoch.to_rfc3339()
        ));
    }

    let month = date.month0() as usize;
    let day = date.day();
    match calendar.days_in_month(month) {
        None => DateValidation::invalid(format!(
            "month {} is outside the {}-month year of {}",
            month + 1,
            calendar.months_per_year,
            calendar.name
        )),
        Some(days) if day > days => DateValidation::invalid(format!(
            "{} has {} days, got day {}",
            calendar.month_name(month).unwrap_or("month"),
            days,
            day
        )),
        Some(_) => DateValidation::ok(),
    }
}

/// Formats a world date. With a calendar: `"DD MonthName YYYY"` plus a
/// zero-padded `" HH:MM:SS"` when `include_time`. Without: ISO 8601.
pub fn format_world_date(
    date: DateTime<Utc>,
    calendar: Option<&Calendar>,
    include_time: bool,
) -> CoreResult<String> {
    let calendar = match calendar {
        Some(calendar) => calendar,
        None => {
            return Ok(date.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        }
    };

    let month = date.month0() as usize;
    let month_name = calendar.month_name(month).ok_or_else(|| {
        CoreError::validation(format!(
            "month {} is outside the {}-month year of {}",
            month + 1,
            calendar.months_per_year,
            calendar.name
        ))
    })?;

    let mut out = format!("{:02} {} {}", date.day(), month_name, date.year());
    if include_time {
        out.push_str(&format!(
            " {:02}:{:02}:{:02}",
            date.hour(),
            date.minute(),
            date.second()
        ));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn absalom_reckoning() -> Calendar {
    Calendar {
        id: Uuid::new_v4(),
        name: "Absalom Reckoning".to_string(),
        months_per_year: 12,
        days_per_month: vec![31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31],
        month_names: [
            "Abadius", "Calistril", "Pharast", "Gozran", "Desnus", "Sarenith", "Erastus",
            "Arodus", "Rova", "Lamashan", "Neth", "Kuthona",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
        epoch: chrono::TimeZone::with_ymd_and_hms(&Utc, 1, 1, 1, 0, 0, 0).unwrap(),
        notes: None,
    }
}
