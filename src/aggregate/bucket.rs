//! UTC-aligned bucket boundaries.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::models::{Bucket, BucketKind};

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        first_of_month(date.year() + 1, 1)
    } else {
        first_of_month(date.year(), date.month() + 1)
    }
}

impl Bucket {
    /// The calendar bucket of `kind` containing `ts`.
    ///
    /// Days start at midnight UTC, weeks on Monday, months on the first.
    /// Returns `None` for [`BucketKind::Current`], which is not calendar-aligned.
    pub fn containing(kind: BucketKind, ts: DateTime<Utc>) -> Option<Bucket> {
        let date = ts.date_naive();
        let (start, end) = match kind {
            BucketKind::Current => return None,
            BucketKind::Day => {
                let start = midnight(date)?;
                (start, start + Duration::days(1))
            }
            BucketKind::Week => {
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                let start = midnight(monday)?;
                (start, start + Duration::days(7))
            }
            BucketKind::Month => {
                let first = first_of_month(date.year(), date.month())?;
                (midnight(first)?, midnight(next_month(first)?)?)
            }
        };
        Some(Bucket { kind, start, end })
    }

    /// Trailing window of `hours` ending at `now`.
    pub fn current(now: DateTime<Utc>, hours: i64) -> Bucket {
        Bucket {
            kind: BucketKind::Current,
            start: now - Duration::hours(hours.max(1)),
            end: now,
        }
    }

    /// The bucket of the same kind immediately before this one.
    pub fn previous(&self) -> Option<Bucket> {
        match self.kind {
            BucketKind::Current => {
                let width = self.end - self.start;
                Some(Bucket {
                    kind: BucketKind::Current,
                    start: self.start - width,
                    end: self.start,
                })
            }
            kind => Bucket::containing(kind, self.start - Duration::microseconds(1)),
        }
    }

    /// The `count` most recent buckets of `kind` ending with the one
    /// containing `now`, newest first.
    pub fn history(kind: BucketKind, now: DateTime<Utc>, count: usize) -> Vec<Bucket> {
        let mut out = Vec::with_capacity(count);
        let mut next = Bucket::containing(kind, now);
        while let Some(bucket) = next {
            if out.len() >= count {
                break;
            }
            out.push(bucket);
            next = bucket.previous();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn day_bucket_is_midnight_aligned() {
        let b = Bucket::containing(BucketKind::Day, at(2025, 3, 5, 17)).unwrap();
        assert_eq!(b.start, at(2025, 3, 5, 0));
        assert_eq!(b.end, at(2025, 3, 6, 0));
        assert!(b.contains(at(2025, 3, 5, 0)));
        assert!(!b.contains(at(2025, 3, 6, 0)));
    }

    #[test]
    fn week_starts_monday() {
        // 2025-03-05 is a Wednesday.
        let b = Bucket::containing(BucketKind::Week, at(2025, 3, 5, 9)).unwrap();
        assert_eq!(b.start, at(2025, 3, 3, 0));
        assert_eq!(b.end, at(2025, 3, 10, 0));
        // Sunday belongs to the week that started the previous Monday.
        let sunday = Bucket::containing(BucketKind::Week, at(2025, 3, 9, 23)).unwrap();
        assert_eq!(sunday, b);
    }

    #[test]
    fn month_handles_year_rollover() {
        let b = Bucket::containing(BucketKind::Month, at(2024, 12, 31, 23)).unwrap();
        assert_eq!(b.start, at(2024, 12, 1, 0));
        assert_eq!(b.end, at(2025, 1, 1, 0));
        let feb = Bucket::containing(BucketKind::Month, at(2024, 2, 29, 12)).unwrap();
        assert_eq!(feb.end, at(2024, 3, 1, 0));
    }

    #[test]
    fn history_walks_backwards() {
        let days = Bucket::history(BucketKind::Day, at(2025, 3, 1, 10), 3);
        let starts: Vec<_> = days.iter().map(|b| b.start).collect();
        assert_eq!(
            starts,
            vec![at(2025, 3, 1, 0), at(2025, 2, 28, 0), at(2025, 2, 27, 0)]
        );
        let months = Bucket::history(BucketKind::Month, at(2025, 1, 15, 0), 2);
        assert_eq!(months[1].start, at(2024, 12, 1, 0));
    }

    #[test]
    fn current_window_trails_now() {
        let now = at(2025, 3, 1, 12);
        let b = Bucket::current(now, 24);
        assert_eq!(b.start, at(2025, 2, 28, 12));
        assert_eq!(b.end, now);
        assert_eq!(Bucket::containing(BucketKind::Current, now), None);
    }
}
