//! Stay arithmetic: which nights a stay covers and what they cost.

use chrono::Duration;

use crate::limits::*;
use crate::model::Day;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StayError {
    /// Checkout is on or before the first night.
    Empty,
    TooLong(usize),
}

impl std::fmt::Display for StayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StayError::Empty => write!(f, "end date must be after start date"),
            StayError::TooLong(n) => {
                write!(f, "stay of {n} nights exceeds the maximum of {MAX_STAY_NIGHTS}")
            }
        }
    }
}

impl std::error::Error for StayError {}

/// The nights of a stay: `[start, end)`. The checkout day is not a night.
pub fn nights(start: Day, end: Day) -> Result<Vec<Day>, StayError> {
    if end <= start {
        return Err(StayError::Empty);
    }
    let count = (end - start).num_days() as usize;
    if count > MAX_STAY_NIGHTS {
        return Err(StayError::TooLong(count));
    }
    Ok((0..count as i64).map(|i| start + Duration::days(i)).collect())
}

/// Price of one night: base scaled by `(10000 + markup_bp) / 10000`, rounded half up.
pub fn night_price(base: u64, markup_bp: i32) -> u64 {
    let factor = (10_000 + markup_bp as i64).max(0) as u128;
    ((base as u128 * factor + 5_000) / 10_000) as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NightPrice {
    pub date: Day,
    pub markup_bp: i32,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub nights: Vec<NightPrice>,
    pub total: u64,
}

pub fn quote(base: u64, markups: &[(Day, i32)]) -> Quote {
    let nights: Vec<NightPrice> = markups
        .iter()
        .map(|&(date, markup_bp)| NightPrice {
            date,
            markup_bp,
            price: night_price(base, markup_bp),
        })
        .collect();
    let total = nights.iter().map(|n| n.price).sum();
    Quote { nights, total }
}

/// Convert a fractional markup (`0.05` = 5%) to basis points.
pub fn markup_from_fraction(fraction: f64) -> Option<i32> {
    if !fraction.is_finite() {
        return None;
    }
    let bp = (fraction * 10_000.0).round();
    if bp < MIN_MARKUP_BP as f64 || bp > MAX_MARKUP_BP as f64 {
        return None;
    }
    Some(bp as i32)
}

pub fn markup_to_fraction(bp: i32) -> f64 {
    bp as f64 / 10_000.0
}
