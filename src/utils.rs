use crate::error::{ModelError, Result};
use chrono::{Datelike, NaiveDate};

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Moves `date` by `months` calendar months (negative goes back) and snaps to
/// the end of the resulting month.
pub fn advance_month_end(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    let total = date.year() * 12 + date.month0() as i32 + months;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    last_day_of_month(year, month)
}

pub fn next_month_end(date: NaiveDate) -> Option<NaiveDate> {
    advance_month_end(date, 1)
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// `YYYY-MM` label for a period ending on `date`.
pub fn period_label(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}

/// Parses a period string in the format "YYYY-MM" or "YYYY-MM:YYYY-MM"
/// Returns (start_date, end_date)
pub fn parse_period_string(period: &str) -> Result<(NaiveDate, NaiveDate)> {
    let parts: Vec<&str> = period.split(':').collect();

    match parts.as_slice() {
        [month] => {
            let start_date = parse_month_start(month)?;
            Ok((start_date, month_end_of(start_date)?))
        }
        [first, last] => {
            let start_date = parse_month_start(first)?;
            let end_date = month_end_of(parse_month_start(last)?)?;
            if end_date < start_date {
                return Err(ModelError::DateError(format!(
                    "Period range ends before it starts: {}",
                    period
                )));
            }
            Ok((start_date, end_date))
        }
        _ => Err(ModelError::DateError(format!(
            "Invalid period format: {}. Expected 'YYYY-MM' or 'YYYY-MM:YYYY-MM'",
            period
        ))),
    }
}

fn parse_month_start(month: &str) -> Result<NaiveDate> {
    let start_str = format!("{}-01", month.trim());
    NaiveDate::parse_from_str(&start_str, "%Y-%m-%d").map_err(|_| {
        ModelError::DateError(format!(
            "Invalid date format in period: {}. Expected YYYY-MM",
            month
        ))
    })
}

fn month_end_of(date: NaiveDate) -> Result<NaiveDate> {
    last_day_of_month(date.year(), date.month())
        .ok_or_else(|| ModelError::DateError(format!("No month end for {}", date)))
}
