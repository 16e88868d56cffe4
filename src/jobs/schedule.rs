use super::types::JobKind;
use chrono::{DateTime, Datelike, Duration, SecondsFormat, TimeZone, Utc, Weekday};

/// Periodic cadence, evaluated on the UTC wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    EveryMinutes(u32),
    EveryHours(u32),
    DailyAt { hour: u32, minute: u32 },
    WeeklyAt { weekday: Weekday, hour: u32, minute: u32 },
}

impl Cadence {
    /// First occurrence strictly after `after`, aligned to UTC midnight.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let day_start = Utc
            .with_ymd_and_hms(after.year(), after.month(), after.day(), 0, 0, 0)
            .single()
            .expect("UTC midnight always exists");

        match self {
            Cadence::EveryMinutes(n) => {
                let step = i64::from(*n) * 60;
                let elapsed = (after - day_start).num_seconds();
                day_start + Duration::seconds((elapsed / step + 1) * step)
            }
            Cadence::EveryHours(n) => {
                let step = i64::from(*n) * 3600;
                let elapsed = (after - day_start).num_seconds();
                day_start + Duration::seconds((elapsed / step + 1) * step)
            }
            Cadence::DailyAt { hour, minute } => {
                let candidate = day_start
                    + Duration::hours(i64::from(*hour))
                    + Duration::minutes(i64::from(*minute));
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Cadence::WeeklyAt {
                weekday,
                hour,
                minute,
            } => {
                let mut candidate = day_start
                    + Duration::hours(i64::from(*hour))
                    + Duration::minutes(i64::from(*minute));
                while candidate.weekday() != *weekday || candidate <= after {
                    candidate += Duration::days(1);
                }
                candidate
            }
        }
    }

    /// Nominal period; bounds the dedup TTL for the occurrence key.
    pub fn period(&self) -> Duration {
        match self {
            Cadence::EveryMinutes(n) => Duration::minutes(i64::from(*n)),
            Cadence::EveryHours(n) => Duration::hours(i64::from(*n)),
            Cadence::DailyAt { .. } => Duration::days(1),
            Cadence::WeeklyAt { .. } => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeriodicEntry {
    pub kind: JobKind,
    pub cadence: Cadence,
}

/// The full periodic schedule, consolidated in one place and loaded once at
/// startup. Cadences are UTC.
pub const PERIODIC_TABLE: &[PeriodicEntry] = &[
    PeriodicEntry {
        kind: JobKind::SweepWeather,
        cadence: Cadence::EveryMinutes(5),
    },
    PeriodicEntry {
        kind: JobKind::DailyWeatherIndices,
        cadence: Cadence::DailyAt { hour: 0, minute: 0 },
    },
    PeriodicEntry {
        kind: JobKind::CheckWeatherTriggers,
        cadence: Cadence::EveryMinutes(10),
    },
    PeriodicEntry {
        kind: JobKind::CheckSubscriptions,
        cadence: Cadence::EveryHours(6),
    },
    PeriodicEntry {
        kind: JobKind::FetchLatestBiomass,
        cadence: Cadence::DailyAt { hour: 2, minute: 0 },
    },
    PeriodicEntry {
        kind: JobKind::CancelExpiredSubscriptions,
        cadence: Cadence::DailyAt { hour: 3, minute: 0 },
    },
    PeriodicEntry {
        kind: JobKind::MonitorBiomassQuality,
        cadence: Cadence::DailyAt { hour: 4, minute: 0 },
    },
    PeriodicEntry {
        kind: JobKind::CleanupBiomassCache,
        cadence: Cadence::WeeklyAt {
            weekday: Weekday::Sun,
            hour: 5,
            minute: 0,
        },
    },
    PeriodicEntry {
        kind: JobKind::ProcessPendingAssessments,
        cadence: Cadence::EveryMinutes(10),
    },
    PeriodicEntry {
        kind: JobKind::ArchiveOldAssessments,
        cadence: Cadence::DailyAt {
            hour: 2,
            minute: 30,
        },
    },
    PeriodicEntry {
        kind: JobKind::HealthCheck,
        cadence: Cadence::EveryMinutes(1),
    },
];

/// Dedup key for one periodic occurrence: identical across processes, so a
/// second beat inside the window is absorbed.
pub fn occurrence_dedup_key(kind: JobKind, occurrence: DateTime<Utc>) -> String {
    format!(
        "{}@{}",
        kind.name(),
        occurrence.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, h, m, s).unwrap()
    }

    #[test]
    fn every_five_minutes_aligns_to_wall_clock() {
        let cadence = Cadence::EveryMinutes(5);
        assert_eq!(cadence.next_occurrence(at(10, 3, 20)), at(10, 5, 0));
        assert_eq!(cadence.next_occurrence(at(10, 5, 0)), at(10, 10, 0));
        // Day rollover.
        assert_eq!(
            cadence.next_occurrence(at(23, 58, 0)),
            Utc.with_ymd_and_hms(2024, 6, 13, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn six_hourly_fires_at_fixed_utc_hours() {
        let cadence = Cadence::EveryHours(6);
        assert_eq!(cadence.next_occurrence(at(5, 0, 0)), at(6, 0, 0));
        assert_eq!(cadence.next_occurrence(at(6, 0, 0)), at(12, 0, 0));
        assert_eq!(cadence.next_occurrence(at(18, 30, 0)), at(0, 0, 0) + Duration::days(1));
    }

    #[test]
    fn daily_cadence_rolls_to_tomorrow_after_fire_time() {
        let cadence = Cadence::DailyAt { hour: 2, minute: 30 };
        assert_eq!(cadence.next_occurrence(at(1, 0, 0)), at(2, 30, 0));
        assert_eq!(
            cadence.next_occurrence(at(2, 30, 0)),
            at(2, 30, 0) + Duration::days(1)
        );
    }

    #[test]
    fn weekly_cadence_lands_on_the_requested_weekday() {
        let cadence = Cadence::WeeklyAt {
            weekday: Weekday::Sun,
            hour: 5,
            minute: 0,
        };
        // 2024-06-12 is a Wednesday; the next Sunday is 2024-06-16.
        let next = cadence.next_occurrence(at(10, 0, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 16, 5, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Sun);
        // Firing exactly at the cadence instant schedules the week after.
        let following = cadence.next_occurrence(next);
        assert_eq!(following, next + Duration::weeks(1));
    }

    #[test]
    fn table_covers_the_contracted_kinds_exactly_once() {
        let kinds: Vec<JobKind> = PERIODIC_TABLE.iter().map(|entry| entry.kind).collect();
        let unique: HashSet<&str> = kinds.iter().map(|kind| kind.name()).collect();
        assert_eq!(kinds.len(), unique.len(), "duplicate periodic kinds");
        for required in [
            JobKind::SweepWeather,
            JobKind::DailyWeatherIndices,
            JobKind::CheckWeatherTriggers,
            JobKind::CheckSubscriptions,
            JobKind::FetchLatestBiomass,
            JobKind::CancelExpiredSubscriptions,
            JobKind::MonitorBiomassQuality,
            JobKind::ProcessPendingAssessments,
            JobKind::ArchiveOldAssessments,
            JobKind::HealthCheck,
        ] {
            assert!(kinds.contains(&required), "{} missing", required.name());
        }
    }

    #[test]
    fn occurrence_keys_are_stable_per_window() {
        let occurrence = at(10, 5, 0);
        assert_eq!(
            occurrence_dedup_key(JobKind::SweepWeather, occurrence),
            occurrence_dedup_key(JobKind::SweepWeather, occurrence),
        );
        assert_ne!(
            occurrence_dedup_key(JobKind::SweepWeather, occurrence),
            occurrence_dedup_key(JobKind::SweepWeather, at(10, 10, 0)),
        );
    }
}
