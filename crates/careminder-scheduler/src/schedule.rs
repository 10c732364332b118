use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};

use crate::types::{Occurrence, RecurrenceSpec};

/// Days scanned by [`next_occurrence`]: the rest of this week plus all of next.
const NEXT_OCCURRENCE_SCAN_DAYS: usize = 14;

/// The reminder instant on `date`, if `date` is one of its weekdays.
fn candidate_on(spec: &RecurrenceSpec, date: NaiveDate) -> Option<Occurrence> {
    spec.weekdays
        .contains_date(date)
        .then(|| date.and_time(spec.time.to_naive()))
}

/// Calendar dates starting at `now`'s date.
fn dates_from(now: NaiveDateTime) -> impl Iterator<Item = NaiveDate> {
    now.date().iter_days()
}

/// The soonest occurrence of `spec` strictly after `now`.
///
/// Returns `None` only when the weekday set is empty, which the validated
/// constructors never produce.
pub fn next_occurrence(spec: &RecurrenceSpec, now: NaiveDateTime) -> Option<Occurrence> {
    dates_from(now)
        .take(NEXT_OCCURRENCE_SCAN_DAYS)
        .filter_map(|date| candidate_on(spec, date))
        .find(|candidate| *candidate > now)
}

/// Up to `max_count` occurrences strictly after `now`, in ascending order,
/// drawn from the `horizon_days` calendar dates starting at `now`'s date.
pub fn next_occurrences(
    spec: &RecurrenceSpec,
    now: NaiveDateTime,
    max_count: usize,
    horizon_days: u32,
) -> Vec<Occurrence> {
    dates_from(now)
        .take(horizon_days as usize)
        .filter_map(|date| candidate_on(spec, date))
        .filter(|candidate| *candidate > now)
        .take(max_count)
        .collect()
}

/// 12-hour clock with leading zero, e.g. `"08:00 PM"`.
pub fn format_time(time: NaiveTime) -> String {
    time.format("%I:%M %p").to_string()
}

/// Dashboard label for `occurrence` as seen at `now`.
///
/// Classified by calendar date: `"Today at 08:00 PM"`, `"Tomorrow at 07:00 AM"`,
/// otherwise `"Mon, Jan 15"` without a time.
pub fn format_relative(occurrence: Occurrence, now: NaiveDateTime) -> String {
    let today = now.date();
    let date = occurrence.date();
    if date == today {
        format!("Today at {}", format_time(occurrence.time()))
    } else if today.checked_add_days(Days::new(1)) == Some(date) {
        format!("Tomorrow at {}", format_time(occurrence.time()))
    } else {
        occurrence.format("%a, %b %-d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TimeOfDay, WeekdaySet};
    use chrono::{Duration, Timelike};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn spec(hour: u8, minute: u8, days: &[u8]) -> RecurrenceSpec {
        RecurrenceSpec::new(
            TimeOfDay::new(hour, minute).unwrap(),
            WeekdaySet::new(days.iter().copied()).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn mon_wed_from_sunday_morning() {
        // 2024-01-07 is a Sunday.
        let s = spec(9, 0, &[2, 4]);
        let next = next_occurrence(&s, at(2024, 1, 7, 10, 0));
        assert_eq!(next, Some(at(2024, 1, 8, 9, 0)));
    }

    #[test]
    fn later_today_is_chosen() {
        let s = RecurrenceSpec::daily(TimeOfDay::new(20, 0).unwrap());
        assert_eq!(
            next_occurrence(&s, at(2024, 1, 10, 8, 0)),
            Some(at(2024, 1, 10, 20, 0))
        );
    }

    #[test]
    fn exact_now_is_not_an_occurrence() {
        let s = RecurrenceSpec::daily(TimeOfDay::new(8, 0).unwrap());
        assert_eq!(
            next_occurrence(&s, at(2024, 1, 10, 8, 0)),
            Some(at(2024, 1, 11, 8, 0))
        );
    }

    #[test]
    fn sub_minute_now_past_slot_rolls_over() {
        let s = RecurrenceSpec::daily(TimeOfDay::new(8, 0).unwrap());
        let now = at(2024, 1, 10, 8, 0) + Duration::milliseconds(1);
        assert_eq!(next_occurrence(&s, now), Some(at(2024, 1, 11, 8, 0)));
    }

    #[test]
    fn single_weekday_already_passed_waits_a_week() {
        // Wednesday 2024-01-10 at 10:00, reminder Wednesdays at 09:00.
        let s = spec(9, 0, &[4]);
        assert_eq!(
            next_occurrence(&s, at(2024, 1, 10, 10, 0)),
            Some(at(2024, 1, 17, 9, 0))
        );
    }

    #[test]
    fn crosses_month_and_year_boundaries() {
        // Sunday 2023-12-31 at 23:30; next Monday is 2024-01-01.
        let s = spec(6, 15, &[2]);
        assert_eq!(
            next_occurrence(&s, at(2023, 12, 31, 23, 30)),
            Some(at(2024, 1, 1, 6, 15))
        );
    }

    #[test]
    fn empty_weekdays_yields_none() {
        let s = RecurrenceSpec {
            time: TimeOfDay::new(9, 0).unwrap(),
            weekdays: WeekdaySet::default(),
        };
        assert_eq!(next_occurrence(&s, at(2024, 1, 7, 10, 0)), None);
        assert!(next_occurrences(&s, at(2024, 1, 7, 10, 0), 8, 60).is_empty());
    }

    #[test]
    fn every_non_empty_set_has_a_future_occurrence() {
        let nows = [
            at(2024, 1, 7, 0, 0),
            at(2024, 1, 10, 12, 30),
            at(2024, 2, 29, 23, 59),
            at(2024, 12, 31, 9, 0),
        ];
        for bits in 1u8..128 {
            let days: Vec<u8> = (1..=7).filter(|d| bits & (1 << (d - 1)) != 0).collect();
            for (hour, minute) in [(0, 0), (9, 0), (23, 59)] {
                let s = spec(hour, minute, &days);
                for now in nows {
                    let next = next_occurrence(&s, now).expect("occurrence expected");
                    assert!(next > now);
                    assert!(next - now <= Duration::days(7));
                    assert_eq!(next.second(), 0);
                    assert!(s.weekdays().contains_date(next.date()));
                }
            }
        }
    }

    #[test]
    fn daily_is_within_24_hours() {
        for (hour, minute) in [(0, 0), (7, 30), (12, 0), (23, 59)] {
            let s = RecurrenceSpec::daily(TimeOfDay::new(hour, minute).unwrap());
            let mut now = at(2024, 3, 1, 0, 0);
            for _ in 0..96 {
                let next = next_occurrence(&s, now).unwrap();
                assert!(next > now);
                assert!(next - now <= Duration::hours(24));
                now += Duration::minutes(15);
            }
        }
    }

    #[test]
    fn next_occurrence_is_pure() {
        let s = spec(9, 0, &[2, 4]);
        let now = at(2024, 1, 7, 10, 0);
        assert_eq!(next_occurrence(&s, now), next_occurrence(&s, now));
    }

    #[test]
    fn next_occurrences_strictly_increasing_and_bounded() {
        let s = spec(9, 0, &[2, 4, 6]);
        let now = at(2024, 1, 8, 9, 0);
        let occ = next_occurrences(&s, now, 8, 60);
        assert_eq!(occ.len(), 8);
        assert!(occ.windows(2).all(|w| w[0] < w[1]));
        assert!(occ.iter().all(|o| *o > now));
        // Monday 09:00 itself is excluded; Wednesday is first.
        assert_eq!(occ[0], at(2024, 1, 10, 9, 0));
    }

    #[test]
    fn next_occurrences_single_day_fills_default_horizon() {
        // Monday after its slot: matches start the following Monday.
        let s = spec(9, 0, &[2]);
        let occ = next_occurrences(&s, at(2024, 1, 8, 10, 0), 8, 60);
        assert_eq!(occ.len(), 8);
        assert_eq!(occ[0], at(2024, 1, 15, 9, 0));
        assert_eq!(occ[7], at(2024, 3, 4, 9, 0));
    }

    #[test]
    fn next_occurrences_respects_short_horizon() {
        let s = RecurrenceSpec::daily(TimeOfDay::new(9, 0).unwrap());
        // Today's slot passed; a 3-day horizon leaves two dates.
        let occ = next_occurrences(&s, at(2024, 1, 8, 10, 0), 8, 3);
        assert_eq!(occ, vec![at(2024, 1, 9, 9, 0), at(2024, 1, 10, 9, 0)]);
        assert!(next_occurrences(&s, at(2024, 1, 8, 10, 0), 0, 60).is_empty());
    }

    #[test]
    fn format_relative_today_tomorrow_and_later() {
        let now = at(2024, 1, 10, 8, 0);
        assert_eq!(format_relative(at(2024, 1, 10, 20, 0), now), "Today at 08:00 PM");
        assert_eq!(format_relative(at(2024, 1, 11, 7, 0), now), "Tomorrow at 07:00 AM");
        assert_eq!(format_relative(at(2024, 1, 15, 7, 0), now), "Mon, Jan 15");
    }

    #[test]
    fn format_relative_uses_calendar_date_not_elapsed_time() {
        // Two minutes away but across midnight.
        let now = at(2024, 1, 10, 23, 59);
        assert_eq!(format_relative(at(2024, 1, 11, 0, 1), now), "Tomorrow at 12:01 AM");
        // Within 48 hours but two calendar days ahead.
        let now = at(2024, 1, 10, 22, 0);
        assert_eq!(format_relative(at(2024, 1, 12, 6, 0), now), "Fri, Jan 12");
    }

    #[test]
    fn format_time_is_twelve_hour() {
        assert_eq!(format_time(NaiveTime::from_hms_opt(0, 5, 0).unwrap()), "12:05 AM");
        assert_eq!(format_time(NaiveTime::from_hms_opt(13, 30, 0).unwrap()), "01:30 PM");
    }
}
