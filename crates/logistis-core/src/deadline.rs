use chrono::{Datelike, NaiveDate};
use thiserror::Error;

use crate::models::{DeadlineType, Frequency, ObligationType, Period};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("deadline_type specific_day requires a configured deadline_day")]
    MissingDeadlineDay,
    #[error("deadline_day must be between 1 and 31, got {0}")]
    InvalidDeadlineDay(u32),
    #[error("frequency follows_vat requires a referenced obligation type")]
    FollowsRequiresReference,
    #[error("obligation type {0} follows another type but no follows_type_id is configured")]
    MissingFollowsReference(String),
    #[error("obligation type {follower} follows {target}, which itself follows another type")]
    ChainedFollowsReference { follower: String, target: String },
    #[error("no valid calendar date for month {month} of year {year}")]
    OutOfRangeDate { month: u32, year: i32 },
}

fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate, DeadlineError> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .ok_or(DeadlineError::OutOfRangeDate { month, year })
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 { (year - 1, 12) } else { (year, month - 1) }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

/// Due date for a single target month under one deadline rule.
pub fn month_deadline(
    deadline_type: DeadlineType,
    deadline_day: Option<u32>,
    month: u32,
    year: i32,
) -> Result<NaiveDate, DeadlineError> {
    match deadline_type {
        DeadlineType::LastDay => last_day_of_month(year, month),
        DeadlineType::SpecificDay => {
            let day = deadline_day.ok_or(DeadlineError::MissingDeadlineDay)?;
            if !(1..=31).contains(&day) {
                return Err(DeadlineError::InvalidDeadlineDay(day));
            }
            let last = last_day_of_month(year, month)?;
            let clamped = day.min(last.day());
            NaiveDate::from_ymd_opt(year, month, clamped)
                .ok_or(DeadlineError::OutOfRangeDate { month, year })
        }
        DeadlineType::LastDayPrev => {
            let (y, m) = prev_month(year, month);
            last_day_of_month(y, m)
        }
        DeadlineType::LastDayNext => {
            let (y, m) = next_month(year, month);
            last_day_of_month(y, m)
        }
    }
}

fn quarter_end_month(month: u32) -> u32 {
    ((month - 1) / 3) * 3 + 3
}

/// Due date for a target period. Quarterly and annual frequencies apply the
/// deadline rule to the quarter-end and year-end month respectively.
/// `follows_vat` cannot be computed here; use [`resolve_deadline`].
pub fn deadline_for(
    frequency: Frequency,
    deadline_type: DeadlineType,
    deadline_day: Option<u32>,
    period: Period,
) -> Result<NaiveDate, DeadlineError> {
    match frequency {
        Frequency::Monthly => month_deadline(deadline_type, deadline_day, period.month, period.year),
        Frequency::Quarterly => month_deadline(
            deadline_type,
            deadline_day,
            quarter_end_month(period.month),
            period.year,
        ),
        Frequency::Annual => month_deadline(deadline_type, deadline_day, 12, period.year),
        Frequency::FollowsVat => Err(DeadlineError::FollowsRequiresReference),
    }
}

/// Whether a type's cadence produces an instance for the given target
/// month. Quarterly types file only in quarter-end months and annual types
/// only in December; a following type files on its referenced type's
/// cadence.
pub fn due_in_month(
    ty: &ObligationType,
    referenced: Option<&ObligationType>,
    month: u32,
) -> bool {
    let frequency = match ty.frequency {
        Frequency::FollowsVat => match referenced {
            Some(target) => target.frequency,
            None => return false,
        },
        other => other,
    };
    match frequency {
        Frequency::Monthly => true,
        Frequency::Quarterly => quarter_end_month(month) == month,
        Frequency::Annual => month == 12,
        Frequency::FollowsVat => false,
    }
}

/// Due date for an obligation type, resolving a `follows_vat` rule through
/// its explicitly referenced type. References resolve one level only; a
/// reference to another following type is a configuration error.
pub fn resolve_deadline(
    ty: &ObligationType,
    referenced: Option<&ObligationType>,
    period: Period,
) -> Result<NaiveDate, DeadlineError> {
    if ty.frequency != Frequency::FollowsVat {
        return deadline_for(ty.frequency, ty.deadline_type, ty.deadline_day, period);
    }

    let target = referenced.ok_or_else(|| DeadlineError::MissingFollowsReference(ty.code.clone()))?;
    if target.frequency == Frequency::FollowsVat {
        return Err(DeadlineError::ChainedFollowsReference {
            follower: ty.code.clone(),
            target: target.code.clone(),
        });
    }
    deadline_for(
        target.frequency,
        target.deadline_type,
        target.deadline_day,
        period,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn period(month: u32, year: i32) -> Period {
        Period::new(month, year).unwrap()
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn obligation_type(
        code: &str,
        frequency: Frequency,
        deadline_type: DeadlineType,
        deadline_day: Option<u32>,
        follows_type_id: Option<Uuid>,
    ) -> ObligationType {
        ObligationType {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            frequency,
            deadline_type,
            deadline_day,
            follows_type_id,
            exclusion_group_id: None,
            is_active: true,
        }
    }

    #[test]
    fn monthly_last_day_handles_leap_february() {
        let due = deadline_for(
            Frequency::Monthly,
            DeadlineType::LastDay,
            None,
            period(2, 2024),
        )
        .unwrap();
        assert_eq!(due, date(2024, 2, 29));

        let due = deadline_for(
            Frequency::Monthly,
            DeadlineType::LastDay,
            None,
            period(2, 2025),
        )
        .unwrap();
        assert_eq!(due, date(2025, 2, 28));
    }

    #[test]
    fn specific_day_clamps_to_short_month() {
        let due = deadline_for(
            Frequency::Monthly,
            DeadlineType::SpecificDay,
            Some(31),
            period(4, 2025),
        )
        .unwrap();
        assert_eq!(due, date(2025, 4, 30));
    }

    #[test]
    fn specific_day_without_day_is_a_configuration_error() {
        let err = deadline_for(
            Frequency::Monthly,
            DeadlineType::SpecificDay,
            None,
            period(4, 2025),
        )
        .unwrap_err();
        assert_eq!(err, DeadlineError::MissingDeadlineDay);
    }

    #[test]
    fn specific_day_rejects_zero_and_oversized_days() {
        let err = month_deadline(DeadlineType::SpecificDay, Some(0), 4, 2025).unwrap_err();
        assert_eq!(err, DeadlineError::InvalidDeadlineDay(0));
        let err = month_deadline(DeadlineType::SpecificDay, Some(32), 4, 2025).unwrap_err();
        assert_eq!(err, DeadlineError::InvalidDeadlineDay(32));
    }

    #[test]
    fn last_day_prev_and_next_cross_year_boundaries() {
        let due = month_deadline(DeadlineType::LastDayPrev, None, 1, 2025).unwrap();
        assert_eq!(due, date(2024, 12, 31));
        let due = month_deadline(DeadlineType::LastDayNext, None, 12, 2024).unwrap();
        assert_eq!(due, date(2025, 1, 31));
    }

    #[test]
    fn quarterly_applies_rule_to_quarter_end_month() {
        let due = deadline_for(
            Frequency::Quarterly,
            DeadlineType::LastDay,
            None,
            period(2, 2025),
        )
        .unwrap();
        assert_eq!(due, date(2025, 3, 31));

        let due = deadline_for(
            Frequency::Quarterly,
            DeadlineType::SpecificDay,
            Some(25),
            period(5, 2025),
        )
        .unwrap();
        assert_eq!(due, date(2025, 6, 25));
    }

    #[test]
    fn annual_applies_rule_to_december() {
        let due = deadline_for(
            Frequency::Annual,
            DeadlineType::LastDayNext,
            None,
            period(7, 2024),
        )
        .unwrap();
        assert_eq!(due, date(2025, 1, 31));
    }

    #[test]
    fn follows_vat_mirrors_the_referenced_type() {
        let vat = obligation_type("VAT", Frequency::Monthly, DeadlineType::LastDay, None, None);
        let follower = obligation_type(
            "INTRASTAT",
            Frequency::FollowsVat,
            DeadlineType::LastDay,
            None,
            Some(vat.id),
        );

        let due = resolve_deadline(&follower, Some(&vat), period(2, 2024)).unwrap();
        assert_eq!(due, date(2024, 2, 29));
    }

    #[test]
    fn follows_vat_without_reference_fails() {
        let follower = obligation_type(
            "INTRASTAT",
            Frequency::FollowsVat,
            DeadlineType::LastDay,
            None,
            None,
        );
        let err = resolve_deadline(&follower, None, period(2, 2024)).unwrap_err();
        assert_eq!(
            err,
            DeadlineError::MissingFollowsReference("INTRASTAT".to_string())
        );
    }

    #[test]
    fn follows_vat_cannot_chain() {
        let first = obligation_type(
            "A",
            Frequency::FollowsVat,
            DeadlineType::LastDay,
            None,
            None,
        );
        let second = obligation_type(
            "B",
            Frequency::FollowsVat,
            DeadlineType::LastDay,
            None,
            Some(first.id),
        );
        let err = resolve_deadline(&second, Some(&first), period(1, 2025)).unwrap_err();
        assert_eq!(
            err,
            DeadlineError::ChainedFollowsReference {
                follower: "B".to_string(),
                target: "A".to_string(),
            }
        );
    }

    #[test]
    fn quarterly_and_annual_types_are_due_only_at_cycle_end() {
        let monthly =
            obligation_type("VAT", Frequency::Monthly, DeadlineType::LastDay, None, None);
        let quarterly =
            obligation_type("APD", Frequency::Quarterly, DeadlineType::LastDay, None, None);
        let annual = obligation_type("E3", Frequency::Annual, DeadlineType::LastDay, None, None);

        assert!(due_in_month(&monthly, None, 7));
        assert!(!due_in_month(&quarterly, None, 2));
        assert!(due_in_month(&quarterly, None, 3));
        assert!(due_in_month(&quarterly, None, 12));
        assert!(!due_in_month(&annual, None, 6));
        assert!(due_in_month(&annual, None, 12));
    }

    #[test]
    fn following_types_inherit_the_referenced_cadence() {
        let vat = obligation_type("VAT", Frequency::Quarterly, DeadlineType::LastDay, None, None);
        let follower = obligation_type(
            "INTRASTAT",
            Frequency::FollowsVat,
            DeadlineType::LastDay,
            None,
            Some(vat.id),
        );

        assert!(!due_in_month(&follower, Some(&vat), 1));
        assert!(due_in_month(&follower, Some(&vat), 3));
        assert!(!due_in_month(&follower, None, 3));
    }

    #[test]
    fn same_inputs_always_produce_the_same_date() {
        let a = deadline_for(
            Frequency::Quarterly,
            DeadlineType::SpecificDay,
            Some(20),
            period(8, 2026),
        )
        .unwrap();
        let b = deadline_for(
            Frequency::Quarterly,
            DeadlineType::SpecificDay,
            Some(20),
            period(8, 2026),
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
