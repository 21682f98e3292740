use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientRequest {
    pub afm: String,
    pub eponimia: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateClientRequest {
    pub eponimia: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientView {
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
pub struct UpsertObligationTypeRequest {
    pub code: String,
    pub name: String,
    pub frequency: String,
    pub deadline_type: String,
    pub deadline_day: Option<i32>,
    pub follows_type_id: Option<Uuid>,
    pub exclusion_group_id: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationTypeView {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub frequency: String,
    pub deadline_type: String,
    pub deadline_day: Option<i32>,
    pub follows_type_id: Option<Uuid>,
    pub exclusion_group_id: Option<i32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertObligationProfileRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub type_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationProfileView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub type_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSelectionView {
    pub client_id: Uuid,
    pub obligation_type_ids: Vec<Uuid>,
    pub obligation_profile_ids: Vec<Uuid>,
    /// Ids the one-per-exclusion-group normalization had to drop on load.
    #[serde(default)]
    pub normalization_dropped: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveClientSelectionRequest {
    #[serde(default)]
    pub obligation_type_ids: Vec<Uuid>,
    #[serde(default)]
    pub obligation_profile_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveClientSelectionResponse {
    pub client_id: Uuid,
    pub obligation_type_ids: Vec<Uuid>,
    pub obligation_profile_ids: Vec<Uuid>,
    pub normalization_dropped: Vec<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAssignRequest {
    #[serde(default)]
    pub client_ids: Vec<Uuid>,
    #[serde(default)]
    pub obligation_type_ids: Vec<Uuid>,
    #[serde(default)]
    pub obligation_profile_ids: Vec<Uuid>,
    #[serde(default = "default_assign_mode")]
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAssignResponse {
    pub clients_processed: u64,
    pub selections_created: u64,
    pub selections_removed: u64,
    pub clients_changed: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateObligationsRequest {
    pub month: u32,
    pub year: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateObligationsResponse {
    pub period_month: u32,
    pub period_year: i32,
    pub created: u64,
    pub skipped_existing: u64,
    pub clients_processed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationView {
    pub id: Uuid,
    pub client_id: Uuid,
    pub obligation_type_id: Uuid,
    pub type_code: String,
    pub period_month: i32,
    pub period_year: i32,
    pub deadline: NaiveDate,
    pub status: String,
    pub completed_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateObligationStatusRequest {
    pub status: String,
    pub notes: Option<String>,
}

fn default_assign_mode() -> String {
    "add".to_string()
}
