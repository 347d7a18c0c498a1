use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;

/// Compute the next UTC instant at which `hour:00` local time (in `tz`)
/// occurs strictly after `from`.
///
/// Mirrors a daily fixed-hour schedule: build today's local-hour candidate,
/// and if it has already passed, advance by one day.
pub fn next_local_hour_boundary(tz: Tz, hour: u8, from: DateTime<Utc>) -> DateTime<Utc> {
    let local_now = from.with_timezone(&tz);
    let candidate_naive = local_now
        .date_naive()
        .and_hms_opt(hour as u32, 0, 0)
        .expect("hour is validated to be 0..24 at configuration load");

    let candidate = match tz.from_local_datetime(&candidate_naive).single() {
        Some(dt) => dt,
        // DST gap or ambiguity at the exact boundary: fall back to the
        // earliest of the two local interpretations.
        None => tz
            .from_local_datetime(&candidate_naive)
            .earliest()
            .unwrap_or(local_now),
    };

    let candidate_utc = candidate.with_timezone(&Utc);
    if candidate_utc > from {
        candidate_utc
    } else {
        candidate_utc + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn schedules_for_later_today_when_the_hour_has_not_passed() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap();
        let next = next_local_hour_boundary(chrono_tz::UTC, 3, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn advances_to_tomorrow_once_the_hour_has_passed() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 5, 0, 0).unwrap();
        let next = next_local_hour_boundary(chrono_tz::UTC, 3, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn honours_a_non_utc_timezone() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 30, 0).unwrap();
        let next = next_local_hour_boundary(chrono_tz::Europe::Berlin, 3, now);
        // 03:00 CEST (UTC+2) on 2024-06-01 is 01:00 UTC, already passed relative
        // to 00:30 UTC? No: 00:30 UTC < 01:00 UTC, so it still fires today.
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap());
    }
}
