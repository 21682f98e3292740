use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported frequency: {0}")]
    Frequency(String),
    #[error("unsupported deadline_type: {0}")]
    DeadlineType(String),
    #[error("unsupported status: {0}")]
    Status(String),
    #[error("month must be between 1 and 12, got {0}")]
    Month(u32),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Monthly,
    Quarterly,
    Annual,
    FollowsVat,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Annual => "annual",
            Frequency::FollowsVat => "follows_vat",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            "annual" => Ok(Frequency::Annual),
            "follows_vat" => Ok(Frequency::FollowsVat),
            other => Err(ParseError::Frequency(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineType {
    LastDay,
    SpecificDay,
    LastDayPrev,
    LastDayNext,
}

impl DeadlineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlineType::LastDay => "last_day",
            DeadlineType::SpecificDay => "specific_day",
            DeadlineType::LastDayPrev => "last_day_prev",
            DeadlineType::LastDayNext => "last_day_next",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "last_day" => Ok(DeadlineType::LastDay),
            "specific_day" => Ok(DeadlineType::SpecificDay),
            "last_day_prev" => Ok(DeadlineType::LastDayPrev),
            "last_day_next" => Ok(DeadlineType::LastDayNext),
            other => Err(ParseError::DeadlineType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    InProgress,
    Completed,
    Overdue,
    Cancelled,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Pending => "pending",
            ObligationStatus::InProgress => "in_progress",
            ObligationStatus::Completed => "completed",
            ObligationStatus::Overdue => "overdue",
            ObligationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ObligationStatus::Pending),
            "in_progress" => Ok(ObligationStatus::InProgress),
            "completed" => Ok(ObligationStatus::Completed),
            "overdue" => Ok(ObligationStatus::Overdue),
            "cancelled" => Ok(ObligationStatus::Cancelled),
            other => Err(ParseError::Status(other.to_string())),
        }
    }
}

/// A filing period: calendar month of a calendar year.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Period {
    pub month: u32,
    pub year: i32,
}

impl Period {
    pub fn new(month: u32, year: i32) -> Result<Self, ParseError> {
        if !(1..=12).contains(&month) {
            return Err(ParseError::Month(month));
        }
        Ok(Self { month, year })
    }
}

/// AFM: Greek tax identification number, exactly nine ASCII digits.
pub fn valid_afm(afm: &str) -> bool {
    afm.len() == 9 && afm.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub afm: String,
    pub eponimia: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationType {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub frequency: Frequency,
    pub deadline_type: DeadlineType,
    pub deadline_day: Option<u32>,
    pub follows_type_id: Option<Uuid>,
    pub exclusion_group_id: Option<i32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationProfile {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub type_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obligation {
    pub id: Uuid,
    pub client_id: Uuid,
    pub obligation_type_id: Uuid,
    pub period_month: u32,
    pub period_year: i32,
    pub deadline: NaiveDate,
    pub status: ObligationStatus,
    pub completed_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub client_id: Uuid,
    pub file_name: String,
    pub category: Option<String>,
    pub stored_path: String,
    pub size_bytes: i64,
    pub notes: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: Uuid,
    pub client_id: Uuid,
    pub template_id: Option<Uuid>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub client_id: Option<Uuid>,
    pub subject: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub id: Uuid,
    pub client_id: Option<Uuid>,
    pub direction: String,
    pub caller_number: String,
    pub duration_secs: i32,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_round_trips_through_parse() {
        for freq in [
            Frequency::Monthly,
            Frequency::Quarterly,
            Frequency::Annual,
            Frequency::FollowsVat,
        ] {
            assert_eq!(Frequency::parse(freq.as_str()).unwrap(), freq);
        }
        assert!(matches!(
            Frequency::parse("weekly"),
            Err(ParseError::Frequency(_))
        ));
    }

    #[test]
    fn deadline_type_rejects_unknown_value() {
        assert!(DeadlineType::parse("LAST_DAY").is_ok());
        assert!(matches!(
            DeadlineType::parse("mid_month"),
            Err(ParseError::DeadlineType(_))
        ));
    }

    #[test]
    fn period_validates_month() {
        assert!(Period::new(12, 2024).is_ok());
        assert_eq!(Period::new(0, 2024), Err(ParseError::Month(0)));
        assert_eq!(Period::new(13, 2024), Err(ParseError::Month(13)));
    }

    #[test]
    fn afm_requires_nine_digits() {
        assert!(valid_afm("123456789"));
        assert!(!valid_afm("12345678"));
        assert!(!valid_afm("1234567890"));
        assert!(!valid_afm("12345678a"));
        assert!(!valid_afm("12345678ι"));
    }
}
