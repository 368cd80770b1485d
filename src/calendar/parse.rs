use chrono::{DateTime, TimeZone, Utc};
use nom::character::complete::{alpha1, char, digit1, space1};
use nom::combinator::{all_consuming, map_res, opt};
use nom::sequence::{preceded, tuple};
use nom::IResult;

use crate::calendar::Calendar;
use crate::error::{CoreError, CoreResult};

/// Parses a world date. ISO 8601 is always accepted; the
/// `"DD MonthName YYYY[ HH:MM:SS]"` form needs a calendar to resolve month
/// names and day bounds.
pub fn parse_world_date(input: &str, calendar: Option<&Calendar>) -> CoreResult<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CoreError::validation("empty world date"));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let calendar = calendar.ok_or_else(|| {
        CoreError::validation(format!("'{input}' is not an ISO 8601 date"))
    })?;

    let (_, parts) = all_consuming(world_date_parts)(input).map_err(|_| {
        CoreError::validation(format!(
            "'{input}' is neither ISO 8601 nor 'DD MonthName YYYY[ HH:MM:SS]'"
        ))
    })?;
    let WorldDateParts {
        day,
        month_name,
        year,
        time,
    } = parts;

    let month = calendar.month_index(month_name).ok_or_else(|| {
        CoreError::validation(format!(
            "'{month_name}' is not a month of {}",
            calendar.name
        ))
    })?;

    let days_in_month = calendar
        .days_in_month(month)
        .ok_or_else(|| CoreError::validation(format!("month {month} out of range")))?;
    if day == 0 || day > days_in_month {
        return Err(CoreError::validation(format!(
            "{} has {days_in_month} days, got day {day}",
            calendar.month_name(month).unwrap_or("month"),
        )));
    }

    let (hour, minute, second) = time.unwrap_or((0, 0, 0));
    Utc.with_ymd_and_hms(year, month as u32 + 1, day, hour, minute, second)
        .single()
        .ok_or_else(|| {
            CoreError::validation(format!(
                "day {day} of {} cannot be placed on the timestamp grid",
                calendar.month_name(month).unwrap_or("month"),
            ))
        })
}

struct WorldDateParts<'a> {
    day: u32,
    month_name: &'a str,
    year: i32,
    time: Option<(u32, u32, u32)>,
}

fn number<T: std::str::FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, str::parse)(input)
}

fn time_of_day(input: &str) -> IResult<&str, (u32, u32, u32)> {
    let (input, (hour, _, minute, _, second)) =
        tuple((number, char(':'), number, char(':'), number))(input)?;
    Ok((input, (hour, minute, second)))
}

fn world_date_parts(input: &str) -> IResult<&str, WorldDateParts<'_>> {
    let (input, (day, _, month_name, _, year, time)) = tuple((
        number,
        space1,
        alpha1,
        space1,
        number,
        opt(preceded(space1, time_of_day)),
    ))(input)?;
    Ok((
        input,
        WorldDateParts {
            day,
            month_name,
            year,
            time,
        },
    ))
}
