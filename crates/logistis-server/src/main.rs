use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Component, PathBuf},
    sync::Arc,
};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{error, info};
use uuid::Uuid;

use logistis_core::{
    AssignMode, CallLog, Client, DeadlineType, Document, EmailLog, EmailTemplate, Frequency,
    Obligation, ObligationProfile, ObligationStatus, ObligationType, Period, SelectionState,
    Ticket, TypeCatalog, client_vars, due_in_month, plan_bulk_assignment, render,
    resolve_deadline, valid_afm,
};
use logistis_platform::{
    BulkAssignRequest, BulkAssignResponse, ClientSelectionView, ClientView, CreateClientRequest,
    GenerateObligationsRequest, GenerateObligationsResponse, ObligationProfileView,
    ObligationTypeView, ObligationView, SaveClientSelectionRequest, SaveClientSelectionResponse,
    ServiceConfig, UpdateClientRequest, UpdateObligationStatusRequest,
    UpsertObligationProfileRequest, UpsertObligationTypeRequest, connect_database,
};
use logistis_tools::{MessagingTool, TelephonyTool};

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    messenger: Arc<dyn MessagingTool>,
    telephony: Arc<dyn TelephonyTool>,
    backup_dir: PathBuf,
}

/// Outbound integrations log through tracing; wiring a real SMTP or PBX
/// bridge means swapping these trait objects in main().
struct TracingNotifier;

#[async_trait]
impl MessagingTool for TracingNotifier {
    async fn send_email(&self, recipient: &str, subject: &str, _body: &str) -> AnyResult<()> {
        info!("email to {recipient}: {subject}");
        Ok(())
    }
}

#[async_trait]
impl TelephonyTool for TracingNotifier {
    async fn acknowledge_call(&self, caller_number: &str, direction: &str) -> AnyResult<()> {
        info!("{direction} call logged for {caller_number}");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListClientsQuery {
    q: Option<String>,
    afm: Option<String>,
    active: Option<bool>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientListResponse {
    items: Vec<ClientView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListObligationTypesQuery {
    active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObligationTypeListResponse {
    items: Vec<ObligationTypeView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObligationProfileListResponse {
    items: Vec<ObligationProfileView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListObligationsQuery {
    status: Option<String>,
    month: Option<i32>,
    year: Option<i32>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObligationListResponse {
    items: Vec<ObligationView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateDocumentRequest {
    file_name: String,
    category: Option<String>,
    stored_path: String,
    size_bytes: Option<i64>,
    notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentListResponse {
    items: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpsertEmailTemplateRequest {
    name: String,
    subject: String,
    body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailTemplateListResponse {
    items: Vec<EmailTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendEmailRequest {
    template_id: Uuid,
    /// Defaults to the client's email address.
    recipient: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailLogListResponse {
    items: Vec<EmailLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateTicketRequest {
    client_id: Option<Uuid>,
    subject: String,
    description: Option<String>,
    priority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateTicketRequest {
    status: Option<String>,
    priority: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListTicketsQuery {
    status: Option<String>,
    client_id: Option<Uuid>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TicketListResponse {
    items: Vec<Ticket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateCallRequest {
    client_id: Option<Uuid>,
    direction: String,
    caller_number: String,
    duration_secs: Option<i32>,
    notes: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListCallsQuery {
    client_id: Option<Uuid>,
    direction: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallListResponse {
    items: Vec<CallLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SelectionRow {
    client_id: Uuid,
    obligation_type_id: Uuid,
    assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileSelectionRow {
    client_id: Uuid,
    obligation_profile_id: Uuid,
    assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileMemberRow {
    profile_id: Uuid,
    obligation_type_id: Uuid,
    position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupSnapshot {
    created_at: DateTime<Utc>,
    clients: Vec<Client>,
    obligation_types: Vec<ObligationType>,
    obligation_profiles: Vec<ObligationProfile>,
    client_type_selections: Vec<SelectionRow>,
    client_profile_selections: Vec<ProfileSelectionRow>,
    obligations: Vec<Obligation>,
    documents: Vec<Document>,
    email_templates: Vec<EmailTemplate>,
    email_logs: Vec<EmailLog>,
    tickets: Vec<Ticket>,
    call_logs: Vec<CallLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateBackupResponse {
    file_name: String,
    created_at: DateTime<Utc>,
    clients: usize,
    obligation_types: usize,
    obligations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupListEntry {
    file_name: String,
    size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupListResponse {
    items: Vec<BackupListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RestoreBackupRequest {
    file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RestoreBackupResponse {
    file_name: String,
    clients: usize,
    obligation_types: usize,
    obligations: usize,
    restored_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "logistis_server=info,tower_http=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url, config.db_max_connections).await?;

    let state = AppState {
        pool,
        messenger: Arc::new(TracingNotifier),
        telephony: Arc::new(TracingNotifier),
        backup_dir: PathBuf::from(&config.backup_dir),
    };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/clients", get(list_clients).post(create_client))
        .route(
            "/clients/{client_id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route(
            "/obligation-types",
            get(list_obligation_types).post(create_obligation_type),
        )
        .route("/obligation-types/{type_id}", put(update_obligation_type))
        .route(
            "/obligation-profiles",
            get(list_obligation_profiles).post(create_obligation_profile),
        )
        .route(
            "/obligation-profiles/{profile_id}",
            put(update_obligation_profile).delete(delete_obligation_profile),
        )
        .route(
            "/clients/{client_id}/obligation-profile",
            get(get_client_selection).put(save_client_selection),
        )
        .route("/obligations/bulk-assign", post(bulk_assign))
        .route("/obligations/generate", post(generate_obligations))
        .route("/clients/{client_id}/obligations", get(list_client_obligations))
        .route(
            "/obligations/{obligation_id}/status",
            put(update_obligation_status),
        )
        .route(
            "/clients/{client_id}/documents",
            get(list_documents).post(create_document),
        )
        .route("/documents/{document_id}", delete(delete_document))
        .route(
            "/email-templates",
            get(list_email_templates).post(create_email_template),
        )
        .route("/email-templates/{template_id}", put(update_email_template))
        .route(
            "/clients/{client_id}/emails",
            get(list_client_emails).post(send_client_email),
        )
        .route("/tickets", get(list_tickets).post(create_ticket))
        .route("/tickets/{ticket_id}", put(update_ticket))
        .route("/calls", get(list_calls).post(create_call))
        .route("/backup", post(create_backup))
        .route("/backups", get(list_backups))
        .route("/backup/restore", post(restore_backup))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------- clients

async fn create_client(
    State(state): State<AppState>,
    Json(payload): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<ClientView>), (StatusCode, String)> {
    let afm = payload.afm.trim().to_string();
    if !valid_afm(&afm) {
        return Err(bad_request("afm must be exactly nine digits"));
    }
    let eponimia = payload.eponimia.trim().to_string();
    if eponimia.is_empty() {
        return Err(bad_request("eponimia is required"));
    }

    let duplicate = sqlx::query("SELECT id FROM clients WHERE afm = $1")
        .bind(&afm)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;
    if duplicate.is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("a client with afm {afm} already exists"),
        ));
    }

    let now = Utc::now();
    let row = sqlx::query(
        r#"
        INSERT INTO clients (id, afm, eponimia, email, phone, notes, active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
        RETURNING id, afm, eponimia, email, phone, notes, active, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&afm)
    .bind(&eponimia)
    .bind(normalize_optional(payload.email))
    .bind(normalize_optional(payload.phone))
    .bind(normalize_optional(payload.notes))
    .bind(now)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let client = client_from_row(&row).map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(client_view(client))))
}

async fn list_clients(
    State(state): State<AppState>,
    Query(query): Query<ListClientsQuery>,
) -> Result<Json<ClientListResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let name_pattern = query.q.map(|q| format!("%{}%", q.trim()));
    let afm_pattern = query.afm.map(|afm| format!("{}%", afm.trim()));

    let rows = sqlx::query(
        r#"
        SELECT id, afm, eponimia, email, phone, notes, active, created_at, updated_at
        FROM clients
        WHERE ($1::text IS NULL OR eponimia ILIKE $1)
          AND ($2::text IS NULL OR afm LIKE $2)
          AND ($3::boolean IS NULL OR active = $3)
        ORDER BY eponimia ASC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(name_pattern)
    .bind(afm_pattern)
    .bind(query.active)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(client_view(client_from_row(&row).map_err(internal_error)?));
    }
    Ok(Json(ClientListResponse { items }))
}

async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<ClientView>, (StatusCode, String)> {
    let client = fetch_client(&state.pool, client_id).await?;
    Ok(Json(client_view(client)))
}

async fn update_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(payload): Json<UpdateClientRequest>,
) -> Result<Json<ClientView>, (StatusCode, String)> {
    if let Some(eponimia) = &payload.eponimia {
        if eponimia.trim().is_empty() {
            return Err(bad_request("eponimia must not be empty"));
        }
    }

    let row = sqlx::query(
        r#"
        UPDATE clients SET
            eponimia = COALESCE($2, eponimia),
            email = COALESCE($3, email),
            phone = COALESCE($4, phone),
            notes = COALESCE($5, notes),
            active = COALESCE($6, active),
            updated_at = $7
        WHERE id = $1
        RETURNING id, afm, eponimia, email, phone, notes, active, created_at, updated_at
        "#,
    )
    .bind(client_id)
    .bind(payload.eponimia.map(|v| v.trim().to_string()))
    .bind(normalize_optional(payload.email))
    .bind(normalize_optional(payload.phone))
    .bind(normalize_optional(payload.notes))
    .bind(payload.active)
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(not_found)?;

    let client = client_from_row(&row).map_err(internal_error)?;
    Ok(Json(client_view(client)))
}

async fn delete_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    // Obligations, documents, tickets, emails, calls and selection rows go
    // with the client via ON DELETE CASCADE.
    let result = sqlx::query("DELETE FROM clients WHERE id = $1")
        .bind(client_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err(not_found());
    }
    info!("client {client_id} deleted with cascade");
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------------------------------- obligation types

async fn create_obligation_type(
    State(state): State<AppState>,
    Json(payload): Json<UpsertObligationTypeRequest>,
) -> Result<(StatusCode, Json<ObligationTypeView>), (StatusCode, String)> {
    let fields = validate_type_fields(&state.pool, &payload, None).await?;

    let now = Utc::now();
    let row = sqlx::query(
        r#"
        INSERT INTO obligation_types (
            id, code, name, frequency, deadline_type, deadline_day,
            follows_type_id, exclusion_group_id, is_active, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
        RETURNING id, code, name, frequency, deadline_type, deadline_day,
                  follows_type_id, exclusion_group_id, is_active
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&fields.code)
    .bind(&fields.name)
    .bind(fields.frequency.as_str())
    .bind(fields.deadline_type.as_str())
    .bind(fields.deadline_day)
    .bind(fields.follows_type_id)
    .bind(fields.exclusion_group_id)
    .bind(fields.is_active)
    .bind(now)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let ty = obligation_type_from_row(&row).map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(obligation_type_view(ty))))
}

async fn update_obligation_type(
    State(state): State<AppState>,
    Path(type_id): Path<Uuid>,
    Json(payload): Json<UpsertObligationTypeRequest>,
) -> Result<Json<ObligationTypeView>, (StatusCode, String)> {
    let fields = validate_type_fields(&state.pool, &payload, Some(type_id)).await?;

    let row = sqlx::query(
        r#"
        UPDATE obligation_types SET
            code = $2, name = $3, frequency = $4, deadline_type = $5,
            deadline_day = $6, follows_type_id = $7, exclusion_group_id = $8,
            is_active = $9, updated_at = $10
        WHERE id = $1
        RETURNING id, code, name, frequency, deadline_type, deadline_day,
                  follows_type_id, exclusion_group_id, is_active
        "#,
    )
    .bind(type_id)
    .bind(&fields.code)
    .bind(&fields.name)
    .bind(fields.frequency.as_str())
    .bind(fields.deadline_type.as_str())
    .bind(fields.deadline_day)
    .bind(fields.follows_type_id)
    .bind(fields.exclusion_group_id)
    .bind(fields.is_active)
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(not_found)?;

    let ty = obligation_type_from_row(&row).map_err(internal_error)?;
    Ok(Json(obligation_type_view(ty)))
}

async fn list_obligation_types(
    State(state): State<AppState>,
    Query(query): Query<ListObligationTypesQuery>,
) -> Result<Json<ObligationTypeListResponse>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT id, code, name, frequency, deadline_type, deadline_day,
               follows_type_id, exclusion_group_id, is_active
        FROM obligation_types
        WHERE ($1::boolean IS NULL OR is_active = $1)
        ORDER BY code ASC
        "#,
    )
    .bind(query.active)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let ty = obligation_type_from_row(&row).map_err(internal_error)?;
        items.push(obligation_type_view(ty));
    }
    Ok(Json(ObligationTypeListResponse { items }))
}

struct ValidatedTypeFields {
    code: String,
    name: String,
    frequency: Frequency,
    deadline_type: DeadlineType,
    deadline_day: Option<i32>,
    follows_type_id: Option<Uuid>,
    exclusion_group_id: Option<i32>,
    is_active: bool,
}

/// Rule-field validation shared by create and update. Unknown frequency or
/// deadline_type combinations are rejected here, never defaulted.
async fn validate_type_fields(
    pool: &PgPool,
    payload: &UpsertObligationTypeRequest,
    updating: Option<Uuid>,
) -> Result<ValidatedTypeFields, (StatusCode, String)> {
    let code = payload.code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(bad_request("code is required"));
    }
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("name is required"));
    }

    let frequency =
        Frequency::parse(&payload.frequency).map_err(|err| bad_request(err.to_string()))?;
    let deadline_type =
        DeadlineType::parse(&payload.deadline_type).map_err(|err| bad_request(err.to_string()))?;

    if deadline_type == DeadlineType::SpecificDay {
        match payload.deadline_day {
            Some(day) if (1..=31).contains(&day) => {}
            Some(day) => {
                return Err(bad_request(format!(
                    "deadline_day must be between 1 and 31, got {day}"
                )));
            }
            None => return Err(bad_request("deadline_type specific_day requires deadline_day")),
        }
    }

    if frequency == Frequency::FollowsVat {
        let follows_id = payload
            .follows_type_id
            .ok_or_else(|| bad_request("frequency follows_vat requires follows_type_id"))?;
        if Some(follows_id) == updating {
            return Err(bad_request("an obligation type cannot follow itself"));
        }
        let target = sqlx::query("SELECT frequency FROM obligation_types WHERE id = $1")
            .bind(follows_id)
            .fetch_optional(pool)
            .await
            .map_err(internal_error)?
            .ok_or_else(|| bad_request("follows_type_id does not name an obligation type"))?;
        let target_frequency: String = target.try_get("frequency").map_err(internal_error)?;
        if Frequency::parse(&target_frequency).map_err(internal_error)? == Frequency::FollowsVat {
            return Err(bad_request(
                "follows_type_id must reference a type with a concrete frequency",
            ));
        }
    }

    let duplicate = sqlx::query("SELECT id FROM obligation_types WHERE code = $1")
        .bind(&code)
        .fetch_optional(pool)
        .await
        .map_err(internal_error)?;
    if let Some(row) = duplicate {
        let existing: Uuid = row.try_get("id").map_err(internal_error)?;
        if updating != Some(existing) {
            return Err((
                StatusCode::CONFLICT,
                format!("an obligation type with code {code} already exists"),
            ));
        }
    }

    Ok(ValidatedTypeFields {
        code,
        name,
        frequency,
        deadline_type,
        deadline_day: payload.deadline_day,
        follows_type_id: if frequency == Frequency::FollowsVat {
            payload.follows_type_id
        } else {
            None
        },
        exclusion_group_id: payload.exclusion_group_id,
        is_active: payload.is_active.unwrap_or(true),
    })
}

// ---------------------------------------------------- obligation profiles

async fn create_obligation_profile(
    State(state): State<AppState>,
    Json(payload): Json<UpsertObligationProfileRequest>,
) -> Result<(StatusCode, Json<ObligationProfileView>), (StatusCode, String)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("name is required"));
    }
    ensure_types_exist(&state.pool, &payload.type_ids).await?;

    let duplicate = sqlx::query("SELECT id FROM obligation_profiles WHERE name = $1")
        .bind(&name)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;
    if duplicate.is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("a profile named {name} already exists"),
        ));
    }

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let profile_id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO obligation_profiles (id, name, description, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        "#,
    )
    .bind(profile_id)
    .bind(&name)
    .bind(normalize_optional(payload.description.clone()))
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    insert_profile_members(&mut tx, profile_id, &payload.type_ids).await?;
    tx.commit().await.map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(ObligationProfileView {
            id: profile_id,
            name,
            description: normalize_optional(payload.description),
            type_ids: dedup_preserving_order(&payload.type_ids),
        }),
    ))
}

async fn update_obligation_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<Uuid>,
    Json(payload): Json<UpsertObligationProfileRequest>,
) -> Result<Json<ObligationProfileView>, (StatusCode, String)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("name is required"));
    }
    ensure_types_exist(&state.pool, &payload.type_ids).await?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let updated = sqlx::query(
        r#"
        UPDATE obligation_profiles
        SET name = $2, description = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(profile_id)
    .bind(&name)
    .bind(normalize_optional(payload.description.clone()))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;
    if updated.rows_affected() == 0 {
        return Err(not_found());
    }

    sqlx::query("DELETE FROM obligation_profile_members WHERE profile_id = $1")
        .bind(profile_id)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    insert_profile_members(&mut tx, profile_id, &payload.type_ids).await?;
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ObligationProfileView {
        id: profile_id,
        name,
        description: normalize_optional(payload.description),
        type_ids: dedup_preserving_order(&payload.type_ids),
    }))
}

async fn delete_obligation_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM obligation_profiles WHERE id = $1")
        .bind(profile_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;
    if result.rows_affected() == 0 {
        return Err(not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_obligation_profiles(
    State(state): State<AppState>,
) -> Result<Json<ObligationProfileListResponse>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT p.id, p.name, p.description, m.obligation_type_id
        FROM obligation_profiles p
        LEFT JOIN obligation_profile_members m ON m.profile_id = p.id
        ORDER BY p.name ASC, m.position ASC
        "#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items: Vec<ObligationProfileView> = Vec::new();
    for row in rows {
        let id: Uuid = row.try_get("id").map_err(internal_error)?;
        let member: Option<Uuid> = row.try_get("obligation_type_id").map_err(internal_error)?;
        match items.last_mut() {
            Some(last) if last.id == id => {
                if let Some(member) = member {
                    last.type_ids.push(member);
                }
            }
            _ => items.push(ObligationProfileView {
                id,
                name: row.try_get("name").map_err(internal_error)?,
                description: row.try_get("description").map_err(internal_error)?,
                type_ids: member.into_iter().collect(),
            }),
        }
    }
    Ok(Json(ObligationProfileListResponse { items }))
}

async fn insert_profile_members(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    profile_id: Uuid,
    type_ids: &[Uuid],
) -> Result<(), (StatusCode, String)> {
    for (position, type_id) in dedup_preserving_order(type_ids).into_iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO obligation_profile_members (profile_id, obligation_type_id, position)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(profile_id)
        .bind(type_id)
        .bind(position as i32)
        .execute(&mut **tx)
        .await
        .map_err(internal_error)?;
    }
    Ok(())
}

// ------------------------------------------------------- client selection

async fn get_client_selection(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<ClientSelectionView>, (StatusCode, String)> {
    fetch_client(&state.pool, client_id).await?;
    let catalog = load_type_catalog(&state.pool).await?;

    let persisted = load_selected_type_ids(&state.pool, client_id).await?;
    let normalized = SelectionState::from_persisted(&catalog, &persisted);
    let profile_ids = load_selected_profile_ids(&state.pool, client_id).await?;

    Ok(Json(ClientSelectionView {
        client_id,
        obligation_type_ids: normalized.state.selected_ids(),
        obligation_profile_ids: profile_ids,
        normalization_dropped: normalized.dropped,
    }))
}

async fn save_client_selection(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(payload): Json<SaveClientSelectionRequest>,
) -> Result<Json<SaveClientSelectionResponse>, (StatusCode, String)> {
    fetch_client(&state.pool, client_id).await?;
    let catalog = load_type_catalog(&state.pool).await?;

    for type_id in &payload.obligation_type_ids {
        if !catalog.contains(*type_id) {
            return Err(bad_request(format!("unknown obligation type: {type_id}")));
        }
    }
    ensure_profiles_exist(&state.pool, &payload.obligation_profile_ids).await?;

    let normalized = SelectionState::from_persisted(&catalog, &payload.obligation_type_ids);
    let type_ids = normalized.state.selected_ids();
    let profile_ids = dedup_preserving_order(&payload.obligation_profile_ids);

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let now = Utc::now();

    sqlx::query("DELETE FROM client_obligation_types WHERE client_id = $1")
        .bind(client_id)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    for type_id in &type_ids {
        sqlx::query(
            r#"
            INSERT INTO client_obligation_types (client_id, obligation_type_id, assigned_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(client_id)
        .bind(type_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    sqlx::query("DELETE FROM client_obligation_profiles WHERE client_id = $1")
        .bind(client_id)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    for profile_id in &profile_ids {
        sqlx::query(
            r#"
            INSERT INTO client_obligation_profiles (client_id, obligation_profile_id, assigned_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(client_id)
        .bind(profile_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    tx.commit().await.map_err(internal_error)?;

    let message = if normalized.dropped.is_empty() {
        format!(
            "saved {} obligation types and {} profiles",
            type_ids.len(),
            profile_ids.len()
        )
    } else {
        format!(
            "saved {} obligation types and {} profiles; deselected {} conflicting type(s)",
            type_ids.len(),
            profile_ids.len(),
            normalized.dropped.len()
        )
    };

    Ok(Json(SaveClientSelectionResponse {
        client_id,
        obligation_type_ids: type_ids,
        obligation_profile_ids: profile_ids,
        normalization_dropped: normalized.dropped,
        message,
    }))
}

// --------------------------------------------------------- bulk assignment

async fn bulk_assign(
    State(state): State<AppState>,
    Json(payload): Json<BulkAssignRequest>,
) -> Result<Json<BulkAssignResponse>, (StatusCode, String)> {
    let mode = AssignMode::parse(&payload.mode).map_err(|err| bad_request(err.to_string()))?;
    if payload.client_ids.is_empty() {
        return Err(bad_request("no clients selected"));
    }
    if payload.obligation_type_ids.is_empty() && payload.obligation_profile_ids.is_empty() {
        return Err(bad_request("select at least one obligation type or profile"));
    }

    let client_ids = dedup_preserving_order(&payload.client_ids);
    let profile_ids = dedup_preserving_order(&payload.obligation_profile_ids);

    let known_clients = sqlx::query("SELECT id FROM clients WHERE id = ANY($1)")
        .bind(&client_ids)
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;
    if known_clients.len() != client_ids.len() {
        return Err(bad_request("one or more client_ids are unknown"));
    }
    ensure_profiles_exist(&state.pool, &profile_ids).await?;

    let catalog = load_type_catalog(&state.pool).await?;
    let profile_expanded = expand_profiles(&state.pool, &profile_ids).await?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT client_id, obligation_type_id
        FROM client_obligation_types
        WHERE client_id = ANY($1)
        ORDER BY assigned_at ASC, obligation_type_id ASC
        "#,
    )
    .bind(&client_ids)
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?;

    let mut existing: Vec<(Uuid, Vec<Uuid>)> =
        client_ids.iter().map(|&id| (id, Vec::new())).collect();
    let mut index: BTreeMap<Uuid, usize> = BTreeMap::new();
    for (i, (id, _)) in existing.iter().enumerate() {
        index.insert(*id, i);
    }
    for row in rows {
        let client_id: Uuid = row.try_get("client_id").map_err(internal_error)?;
        let type_id: Uuid = row.try_get("obligation_type_id").map_err(internal_error)?;
        if let Some(&i) = index.get(&client_id) {
            existing[i].1.push(type_id);
        }
    }

    let plan = plan_bulk_assignment(
        mode,
        &payload.obligation_type_ids,
        &profile_expanded,
        &existing,
        &catalog,
    )
    .map_err(|err| bad_request(err.to_string()))?;

    let now = Utc::now();
    let mut clients_changed = 0u64;
    for client in &plan.clients {
        if !client.removed.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM client_obligation_types
                WHERE client_id = $1 AND obligation_type_id = ANY($2)
                "#,
            )
            .bind(client.client_id)
            .bind(&client.removed)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;
        }
        for type_id in &client.added {
            sqlx::query(
                r#"
                INSERT INTO client_obligation_types (client_id, obligation_type_id, assigned_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (client_id, obligation_type_id) DO NOTHING
                "#,
            )
            .bind(client.client_id)
            .bind(type_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;
        }
        if !client.added.is_empty() || !client.removed.is_empty() {
            clients_changed += 1;
        }

        if mode == AssignMode::Replace {
            sqlx::query("DELETE FROM client_obligation_profiles WHERE client_id = $1")
                .bind(client.client_id)
                .execute(&mut *tx)
                .await
                .map_err(internal_error)?;
        }
        for profile_id in &profile_ids {
            sqlx::query(
                r#"
                INSERT INTO client_obligation_profiles (client_id, obligation_profile_id, assigned_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (client_id, obligation_profile_id) DO NOTHING
                "#,
            )
            .bind(client.client_id)
            .bind(profile_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;
        }
    }

    tx.commit().await.map_err(internal_error)?;

    let message = format!(
        "{} mode: {} selections added and {} removed across {} clients",
        mode.as_str(),
        plan.selections_created,
        plan.selections_removed,
        plan.clients_processed(),
    );
    info!("bulk assignment: {message}");

    Ok(Json(BulkAssignResponse {
        clients_processed: plan.clients_processed(),
        selections_created: plan.selections_created,
        selections_removed: plan.selections_removed,
        clients_changed,
        message,
    }))
}

async fn expand_profiles(
    pool: &PgPool,
    profile_ids: &[Uuid],
) -> Result<Vec<Uuid>, (StatusCode, String)> {
    if profile_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        SELECT obligation_type_id
        FROM obligation_profile_members
        WHERE profile_id = ANY($1)
        ORDER BY profile_id, position ASC
        "#,
    )
    .bind(profile_ids)
    .fetch_all(pool)
    .await
    .map_err(internal_error)?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        ids.push(row.try_get("obligation_type_id").map_err(internal_error)?);
    }
    Ok(dedup_preserving_order(&ids))
}

// ------------------------------------------------------------ obligations

async fn generate_obligations(
    State(state): State<AppState>,
    Json(payload): Json<GenerateObligationsRequest>,
) -> Result<Json<GenerateObligationsResponse>, (StatusCode, String)> {
    let period = Period::new(payload.month, payload.year)
        .map_err(|err| bad_request(err.to_string()))?;

    let types = load_types(&state.pool).await?;
    let types_by_id: BTreeMap<Uuid, &ObligationType> =
        types.iter().map(|ty| (ty.id, ty)).collect();

    // Compute each active type's deadline up front so a misconfigured rule
    // fails the whole request before anything is written. Types whose
    // cadence does not file in this month produce no instance.
    let mut deadlines: BTreeMap<Uuid, NaiveDate> = BTreeMap::new();
    for ty in types.iter().filter(|ty| ty.is_active) {
        let referenced = ty
            .follows_type_id
            .and_then(|id| types_by_id.get(&id).copied());
        let deadline = resolve_deadline(ty, referenced, period).map_err(|err| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("obligation type {}: {err}", ty.code),
            )
        })?;
        if due_in_month(ty, referenced, period.month) {
            deadlines.insert(ty.id, deadline);
        }
    }

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let rows = sqlx::query(
        r#"
        SELECT s.client_id, s.obligation_type_id
        FROM client_obligation_types s
        JOIN clients c ON c.id = s.client_id
        WHERE c.active = TRUE
        ORDER BY s.client_id, s.assigned_at ASC
        "#,
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?;

    let now = Utc::now();
    let mut created = 0u64;
    let mut skipped_existing = 0u64;
    let mut clients_seen: Vec<Uuid> = Vec::new();

    for row in rows {
        let client_id: Uuid = row.try_get("client_id").map_err(internal_error)?;
        let type_id: Uuid = row.try_get("obligation_type_id").map_err(internal_error)?;
        let Some(deadline) = deadlines.get(&type_id) else {
            // Inactive, or not due this month.
            continue;
        };
        if !clients_seen.contains(&client_id) {
            clients_seen.push(client_id);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO obligations (
                id, client_id, obligation_type_id, period_month, period_year,
                deadline, status, completed_date, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', NULL, NULL, $7, $7)
            ON CONFLICT (client_id, obligation_type_id, period_month, period_year) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(type_id)
        .bind(period.month as i32)
        .bind(period.year)
        .bind(deadline)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

        if result.rows_affected() == 1 {
            created += 1;
        } else {
            skipped_existing += 1;
        }
    }

    tx.commit().await.map_err(internal_error)?;
    info!(
        "generated {created} obligations for {}/{} ({skipped_existing} already present)",
        period.month, period.year
    );

    Ok(Json(GenerateObligationsResponse {
        period_month: period.month,
        period_year: period.year,
        created,
        skipped_existing,
        clients_processed: clients_seen.len() as u64,
    }))
}

async fn list_client_obligations(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Query(query): Query<ListObligationsQuery>,
) -> Result<Json<ObligationListResponse>, (StatusCode, String)> {
    fetch_client(&state.pool, client_id).await?;
    let status = query
        .status
        .as_deref()
        .map(ObligationStatus::parse)
        .transpose()
        .map_err(|err| bad_request(err.to_string()))?;
    let limit = query.limit.unwrap_or(200).clamp(1, 500);

    let rows = sqlx::query(
        r#"
        SELECT o.id, o.client_id, o.obligation_type_id, t.code AS type_code,
               o.period_month, o.period_year, o.deadline, o.status,
               o.completed_date, o.notes
        FROM obligations o
        JOIN obligation_types t ON t.id = o.obligation_type_id
        WHERE o.client_id = $1
          AND ($2::text IS NULL OR o.status = $2)
          AND ($3::integer IS NULL OR o.period_month = $3)
          AND ($4::integer IS NULL OR o.period_year = $4)
        ORDER BY o.deadline ASC, t.code ASC
        LIMIT $5
        "#,
    )
    .bind(client_id)
    .bind(status.map(|s| s.as_str()))
    .bind(query.month)
    .bind(query.year)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(ObligationView {
            id: row.try_get("id").map_err(internal_error)?,
            client_id: row.try_get("client_id").map_err(internal_error)?,
            obligation_type_id: row.try_get("obligation_type_id").map_err(internal_error)?,
            type_code: row.try_get("type_code").map_err(internal_error)?,
            period_month: row.try_get("period_month").map_err(internal_error)?,
            period_year: row.try_get("period_year").map_err(internal_error)?,
            deadline: row.try_get("deadline").map_err(internal_error)?,
            status: row.try_get("status").map_err(internal_error)?,
            completed_date: row.try_get("completed_date").map_err(internal_error)?,
            notes: row.try_get("notes").map_err(internal_error)?,
        });
    }
    Ok(Json(ObligationListResponse { items }))
}

async fn update_obligation_status(
    State(state): State<AppState>,
    Path(obligation_id): Path<Uuid>,
    Json(payload): Json<UpdateObligationStatusRequest>,
) -> Result<Json<ObligationView>, (StatusCode, String)> {
    let status =
        ObligationStatus::parse(&payload.status).map_err(|err| bad_request(err.to_string()))?;
    let completed_date = if status == ObligationStatus::Completed {
        Some(Utc::now().date_naive())
    } else {
        None
    };

    let row = sqlx::query(
        r#"
        UPDATE obligations o SET
            status = $2,
            completed_date = $3,
            notes = COALESCE($4, o.notes),
            updated_at = $5
        FROM obligation_types t
        WHERE o.id = $1 AND t.id = o.obligation_type_id
        RETURNING o.id, o.client_id, o.obligation_type_id, t.code AS type_code,
                  o.period_month, o.period_year, o.deadline, o.status,
                  o.completed_date, o.notes
        "#,
    )
    .bind(obligation_id)
    .bind(status.as_str())
    .bind(completed_date)
    .bind(normalize_optional(payload.notes))
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(not_found)?;

    Ok(Json(ObligationView {
        id: row.try_get("id").map_err(internal_error)?,
        client_id: row.try_get("client_id").map_err(internal_error)?,
        obligation_type_id: row.try_get("obligation_type_id").map_err(internal_error)?,
        type_code: row.try_get("type_code").map_err(internal_error)?,
        period_month: row.try_get("period_month").map_err(internal_error)?,
        period_year: row.try_get("period_year").map_err(internal_error)?,
        deadline: row.try_get("deadline").map_err(internal_error)?,
        status: row.try_get("status").map_err(internal_error)?,
        completed_date: row.try_get("completed_date").map_err(internal_error)?,
        notes: row.try_get("notes").map_err(internal_error)?,
    }))
}

// -------------------------------------------------------------- documents

async fn create_document(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), (StatusCode, String)> {
    fetch_client(&state.pool, client_id).await?;
    let file_name = payload.file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(bad_request("file_name is required"));
    }
    let stored_path = payload.stored_path.trim().to_string();
    if stored_path.is_empty() {
        return Err(bad_request("stored_path is required"));
    }

    let row = sqlx::query(
        r#"
        INSERT INTO documents (
            id, client_id, file_name, category, stored_path, size_bytes, notes, uploaded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, client_id, file_name, category, stored_path, size_bytes, notes, uploaded_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(client_id)
    .bind(&file_name)
    .bind(normalize_optional(payload.category))
    .bind(&stored_path)
    .bind(payload.size_bytes.unwrap_or(0).max(0))
    .bind(normalize_optional(payload.notes))
    .bind(Utc::now())
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let document = document_from_row(&row).map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn list_documents(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<DocumentListResponse>, (StatusCode, String)> {
    fetch_client(&state.pool, client_id).await?;
    let rows = sqlx::query(
        r#"
        SELECT id, client_id, file_name, category, stored_path, size_bytes, notes, uploaded_at
        FROM documents
        WHERE client_id = $1
        ORDER BY uploaded_at DESC
        "#,
    )
    .bind(client_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(document_from_row(&row).map_err(internal_error)?);
    }
    Ok(Json(DocumentListResponse { items }))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM documents WHERE id = $1")
        .bind(document_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;
    if result.rows_affected() == 0 {
        return Err(not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------------------------------------------ email

async fn create_email_template(
    State(state): State<AppState>,
    Json(payload): Json<UpsertEmailTemplateRequest>,
) -> Result<(StatusCode, Json<EmailTemplate>), (StatusCode, String)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("name is required"));
    }
    if payload.subject.trim().is_empty() {
        return Err(bad_request("subject is required"));
    }

    let duplicate = sqlx::query("SELECT id FROM email_templates WHERE name = $1")
        .bind(&name)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;
    if duplicate.is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("a template named {name} already exists"),
        ));
    }

    let row = sqlx::query(
        r#"
        INSERT INTO email_templates (id, name, subject, body, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $5)
        RETURNING id, name, subject, body
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&name)
    .bind(payload.subject.trim())
    .bind(&payload.body)
    .bind(Utc::now())
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let template = email_template_from_row(&row).map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn update_email_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    Json(payload): Json<UpsertEmailTemplateRequest>,
) -> Result<Json<EmailTemplate>, (StatusCode, String)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("name is required"));
    }

    let row = sqlx::query(
        r#"
        UPDATE email_templates
        SET name = $2, subject = $3, body = $4, updated_at = $5
        WHERE id = $1
        RETURNING id, name, subject, body
        "#,
    )
    .bind(template_id)
    .bind(&name)
    .bind(payload.subject.trim())
    .bind(&payload.body)
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(not_found)?;

    let template = email_template_from_row(&row).map_err(internal_error)?;
    Ok(Json(template))
}

async fn list_email_templates(
    State(state): State<AppState>,
) -> Result<Json<EmailTemplateListResponse>, (StatusCode, String)> {
    let rows = sqlx::query("SELECT id, name, subject, body FROM email_templates ORDER BY name ASC")
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(email_template_from_row(&row).map_err(internal_error)?);
    }
    Ok(Json(EmailTemplateListResponse { items }))
}

async fn send_client_email(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(payload): Json<SendEmailRequest>,
) -> Result<(StatusCode, Json<EmailLog>), (StatusCode, String)> {
    let client = fetch_client(&state.pool, client_id).await?;

    let recipient = payload
        .recipient
        .and_then(|r| {
            let trimmed = r.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        })
        .or_else(|| client.email.clone())
        .ok_or_else(|| bad_request("client has no email address and no recipient was given"))?;

    let row = sqlx::query("SELECT id, name, subject, body FROM email_templates WHERE id = $1")
        .bind(payload.template_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| bad_request("template_id does not name an email template"))?;
    let template = email_template_from_row(&row).map_err(internal_error)?;

    let vars = client_vars(&client);
    let subject =
        render(&template.subject, &vars).map_err(|err| bad_request(err.to_string()))?;
    let body = render(&template.body, &vars).map_err(|err| bad_request(err.to_string()))?;

    state
        .messenger
        .send_email(&recipient, &subject, &body)
        .await
        .map_err(internal_error)?;

    let log = EmailLog {
        id: Uuid::new_v4(),
        client_id,
        template_id: Some(template.id),
        recipient,
        subject,
        body,
        sent_at: Utc::now(),
    };
    sqlx::query(
        r#"
        INSERT INTO email_logs (id, client_id, template_id, recipient, subject, body, sent_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(log.id)
    .bind(log.client_id)
    .bind(log.template_id)
    .bind(&log.recipient)
    .bind(&log.subject)
    .bind(&log.body)
    .bind(log.sent_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(log)))
}

async fn list_client_emails(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<EmailLogListResponse>, (StatusCode, String)> {
    fetch_client(&state.pool, client_id).await?;
    let rows = sqlx::query(
        r#"
        SELECT id, client_id, template_id, recipient, subject, body, sent_at
        FROM email_logs
        WHERE client_id = $1
        ORDER BY sent_at DESC
        "#,
    )
    .bind(client_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(email_log_from_row(&row).map_err(internal_error)?);
    }
    Ok(Json(EmailLogListResponse { items }))
}

// ---------------------------------------------------------------- tickets

async fn create_ticket(
    State(state): State<AppState>,
    Json(payload): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), (StatusCode, String)> {
    let subject = payload.subject.trim().to_string();
    if subject.is_empty() {
        return Err(bad_request("subject is required"));
    }
    let priority = normalize_priority(payload.priority.as_deref().unwrap_or("normal"))
        .map_err(|err| bad_request(err.to_string()))?;
    if let Some(client_id) = payload.client_id {
        fetch_client(&state.pool, client_id).await?;
    }

    let now = Utc::now();
    let row = sqlx::query(
        r#"
        INSERT INTO tickets (id, client_id, subject, description, status, priority, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'open', $5, $6, $6)
        RETURNING id, client_id, subject, description, status, priority, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payload.client_id)
    .bind(&subject)
    .bind(normalize_optional(payload.description))
    .bind(&priority)
    .bind(now)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let ticket = ticket_from_row(&row).map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn update_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(payload): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, (StatusCode, String)> {
    let status = payload
        .status
        .as_deref()
        .map(normalize_ticket_status)
        .transpose()
        .map_err(|err| bad_request(err.to_string()))?;
    let priority = payload
        .priority
        .as_deref()
        .map(normalize_priority)
        .transpose()
        .map_err(|err| bad_request(err.to_string()))?;

    let row = sqlx::query(
        r#"
        UPDATE tickets SET
            status = COALESCE($2, status),
            priority = COALESCE($3, priority),
            description = COALESCE($4, description),
            updated_at = $5
        WHERE id = $1
        RETURNING id, client_id, subject, description, status, priority, created_at, updated_at
        "#,
    )
    .bind(ticket_id)
    .bind(status)
    .bind(priority)
    .bind(normalize_optional(payload.description))
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(not_found)?;

    let ticket = ticket_from_row(&row).map_err(internal_error)?;
    Ok(Json(ticket))
}

async fn list_tickets(
    State(state): State<AppState>,
    Query(query): Query<ListTicketsQuery>,
) -> Result<Json<TicketListResponse>, (StatusCode, String)> {
    let status = query
        .status
        .as_deref()
        .map(normalize_ticket_status)
        .transpose()
        .map_err(|err| bad_request(err.to_string()))?;
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let rows = sqlx::query(
        r#"
        SELECT id, client_id, subject, description, status, priority, created_at, updated_at
        FROM tickets
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::uuid IS NULL OR client_id = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(status)
    .bind(query.client_id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(ticket_from_row(&row).map_err(internal_error)?);
    }
    Ok(Json(TicketListResponse { items }))
}

// ------------------------------------------------------------------ calls

async fn create_call(
    State(state): State<AppState>,
    Json(payload): Json<CreateCallRequest>,
) -> Result<(StatusCode, Json<CallLog>), (StatusCode, String)> {
    let direction =
        normalize_direction(&payload.direction).map_err(|err| bad_request(err.to_string()))?;
    let caller_number = payload.caller_number.trim().to_string();
    if caller_number.is_empty() {
        return Err(bad_request("caller_number is required"));
    }
    if let Some(client_id) = payload.client_id {
        fetch_client(&state.pool, client_id).await?;
    }

    state
        .telephony
        .acknowledge_call(&caller_number, &direction)
        .await
        .map_err(internal_error)?;

    let call = CallLog {
        id: Uuid::new_v4(),
        client_id: payload.client_id,
        direction,
        caller_number,
        duration_secs: payload.duration_secs.unwrap_or(0).max(0),
        notes: normalize_optional(payload.notes),
        occurred_at: payload.occurred_at.unwrap_or_else(Utc::now),
    };
    sqlx::query(
        r#"
        INSERT INTO call_logs (id, client_id, direction, caller_number, duration_secs, notes, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(call.id)
    .bind(call.client_id)
    .bind(&call.direction)
    .bind(&call.caller_number)
    .bind(call.duration_secs)
    .bind(&call.notes)
    .bind(call.occurred_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(call)))
}

async fn list_calls(
    State(state): State<AppState>,
    Query(query): Query<ListCallsQuery>,
) -> Result<Json<CallListResponse>, (StatusCode, String)> {
    let direction = query
        .direction
        .as_deref()
        .map(normalize_direction)
        .transpose()
        .map_err(|err| bad_request(err.to_string()))?;
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let rows = sqlx::query(
        r#"
        SELECT id, client_id, direction, caller_number, duration_secs, notes, occurred_at
        FROM call_logs
        WHERE ($1::uuid IS NULL OR client_id = $1)
          AND ($2::text IS NULL OR direction = $2)
        ORDER BY occurred_at DESC
        LIMIT $3
        "#,
    )
    .bind(query.client_id)
    .bind(direction)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(call_log_from_row(&row).map_err(internal_error)?);
    }
    Ok(Json(CallListResponse { items }))
}

// ----------------------------------------------------------------- backup

async fn create_backup(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreateBackupResponse>), (StatusCode, String)> {
    let snapshot = read_snapshot(&state.pool).await?;

    let file_name = format!("backup-{}.json", snapshot.created_at.format("%Y%m%dT%H%M%SZ"));
    let serialized = serde_json::to_vec_pretty(&snapshot).map_err(internal_error)?;

    tokio::fs::create_dir_all(&state.backup_dir)
        .await
        .map_err(internal_error)?;
    tokio::fs::write(state.backup_dir.join(&file_name), serialized)
        .await
        .map_err(internal_error)?;

    info!(
        "backup {file_name} written ({} clients, {} obligations)",
        snapshot.clients.len(),
        snapshot.obligations.len()
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateBackupResponse {
            file_name,
            created_at: snapshot.created_at,
            clients: snapshot.clients.len(),
            obligation_types: snapshot.obligation_types.len(),
            obligations: snapshot.obligations.len(),
        }),
    ))
}

async fn list_backups(
    State(state): State<AppState>,
) -> Result<Json<BackupListResponse>, (StatusCode, String)> {
    let mut items = Vec::new();
    let mut dir = match tokio::fs::read_dir(&state.backup_dir).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(BackupListResponse { items }));
        }
        Err(err) => return Err(internal_error(err)),
    };

    while let Some(entry) = dir.next_entry().await.map_err(internal_error)? {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.ends_with(".json") {
            continue;
        }
        let metadata = entry.metadata().await.map_err(internal_error)?;
        items.push(BackupListEntry {
            file_name,
            size_bytes: metadata.len(),
        });
    }
    items.sort_by(|a, b| b.file_name.cmp(&a.file_name));
    Ok(Json(BackupListResponse { items }))
}

async fn restore_backup(
    State(state): State<AppState>,
    Json(payload): Json<RestoreBackupRequest>,
) -> Result<Json<RestoreBackupResponse>, (StatusCode, String)> {
    let file_name = payload.file_name.trim().to_string();
    let as_path = PathBuf::from(&file_name);
    if file_name.is_empty()
        || as_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        || as_path.components().count() != 1
    {
        return Err(bad_request("file_name must be a bare backup file name"));
    }

    let raw = match tokio::fs::read(state.backup_dir.join(&file_name)).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err((StatusCode::NOT_FOUND, format!("no backup named {file_name}")));
        }
        Err(err) => return Err(internal_error(err)),
    };
    let snapshot: BackupSnapshot = serde_json::from_slice(&raw)
        .map_err(|err| bad_request(format!("backup file is not readable: {err}")))?;

    write_snapshot(&state.pool, &snapshot).await?;

    info!(
        "restored {file_name}: {} clients, {} obligations",
        snapshot.clients.len(),
        snapshot.obligations.len()
    );
    Ok(Json(RestoreBackupResponse {
        file_name,
        clients: snapshot.clients.len(),
        obligation_types: snapshot.obligation_types.len(),
        obligations: snapshot.obligations.len(),
        restored_at: Utc::now(),
    }))
}

async fn read_snapshot(pool: &PgPool) -> Result<BackupSnapshot, (StatusCode, String)> {
    let mut tx = pool.begin().await.map_err(internal_error)?;

    let mut clients = Vec::new();
    for row in sqlx::query(
        "SELECT id, afm, eponimia, email, phone, notes, active, created_at, updated_at FROM clients ORDER BY afm",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        clients.push(client_from_row(&row).map_err(internal_error)?);
    }

    let obligation_types = load_types_tx(&mut tx).await?;

    let mut obligation_profiles = Vec::new();
    for row in sqlx::query("SELECT id, name, description FROM obligation_profiles ORDER BY name")
        .fetch_all(&mut *tx)
        .await
        .map_err(internal_error)?
    {
        obligation_profiles.push(ObligationProfile {
            id: row.try_get("id").map_err(internal_error)?,
            name: row.try_get("name").map_err(internal_error)?,
            description: row.try_get("description").map_err(internal_error)?,
            type_ids: Vec::new(),
        });
    }
    let mut members: Vec<ProfileMemberRow> = Vec::new();
    for row in sqlx::query(
        "SELECT profile_id, obligation_type_id, position FROM obligation_profile_members ORDER BY profile_id, position",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        members.push(ProfileMemberRow {
            profile_id: row.try_get("profile_id").map_err(internal_error)?,
            obligation_type_id: row.try_get("obligation_type_id").map_err(internal_error)?,
            position: row.try_get("position").map_err(internal_error)?,
        });
    }
    for member in &members {
        if let Some(profile) = obligation_profiles
            .iter_mut()
            .find(|p| p.id == member.profile_id)
        {
            profile.type_ids.push(member.obligation_type_id);
        }
    }

    let mut client_type_selections = Vec::new();
    for row in sqlx::query(
        "SELECT client_id, obligation_type_id, assigned_at FROM client_obligation_types ORDER BY client_id, assigned_at",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        client_type_selections.push(SelectionRow {
            client_id: row.try_get("client_id").map_err(internal_error)?,
            obligation_type_id: row.try_get("obligation_type_id").map_err(internal_error)?,
            assigned_at: row.try_get("assigned_at").map_err(internal_error)?,
        });
    }

    let mut client_profile_selections = Vec::new();
    for row in sqlx::query(
        "SELECT client_id, obligation_profile_id, assigned_at FROM client_obligation_profiles ORDER BY client_id, assigned_at",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        client_profile_selections.push(ProfileSelectionRow {
            client_id: row.try_get("client_id").map_err(internal_error)?,
            obligation_profile_id: row.try_get("obligation_profile_id").map_err(internal_error)?,
            assigned_at: row.try_get("assigned_at").map_err(internal_error)?,
        });
    }

    let mut obligations = Vec::new();
    for row in sqlx::query(
        r#"
        SELECT id, client_id, obligation_type_id, period_month, period_year,
               deadline, status, completed_date, notes
        FROM obligations ORDER BY period_year, period_month, client_id
        "#,
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        obligations.push(obligation_from_row(&row).map_err(internal_error)?);
    }

    let mut documents = Vec::new();
    for row in sqlx::query(
        "SELECT id, client_id, file_name, category, stored_path, size_bytes, notes, uploaded_at FROM documents ORDER BY uploaded_at",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        documents.push(document_from_row(&row).map_err(internal_error)?);
    }

    let mut email_templates = Vec::new();
    for row in sqlx::query("SELECT id, name, subject, body FROM email_templates ORDER BY name")
        .fetch_all(&mut *tx)
        .await
        .map_err(internal_error)?
    {
        email_templates.push(email_template_from_row(&row).map_err(internal_error)?);
    }

    let mut email_logs = Vec::new();
    for row in sqlx::query(
        "SELECT id, client_id, template_id, recipient, subject, body, sent_at FROM email_logs ORDER BY sent_at",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        email_logs.push(email_log_from_row(&row).map_err(internal_error)?);
    }

    let mut tickets = Vec::new();
    for row in sqlx::query(
        "SELECT id, client_id, subject, description, status, priority, created_at, updated_at FROM tickets ORDER BY created_at",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        tickets.push(ticket_from_row(&row).map_err(internal_error)?);
    }

    let mut call_logs = Vec::new();
    for row in sqlx::query(
        "SELECT id, client_id, direction, caller_number, duration_secs, notes, occurred_at FROM call_logs ORDER BY occurred_at",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?
    {
        call_logs.push(call_log_from_row(&row).map_err(internal_error)?);
    }

    tx.commit().await.map_err(internal_error)?;

    Ok(BackupSnapshot {
        created_at: Utc::now(),
        clients,
        obligation_types,
        obligation_profiles,
        client_type_selections,
        client_profile_selections,
        obligations,
        documents,
        email_templates,
        email_logs,
        tickets,
        call_logs,
    })
}

async fn write_snapshot(
    pool: &PgPool,
    snapshot: &BackupSnapshot,
) -> Result<(), (StatusCode, String)> {
    let mut tx = pool.begin().await.map_err(internal_error)?;
    let now = Utc::now();

    sqlx::query(
        r#"
        TRUNCATE obligations, email_logs, documents, tickets, call_logs,
                 client_obligation_types, client_obligation_profiles,
                 obligation_profile_members, obligation_profiles,
                 obligation_types, email_templates, clients
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    for client in &snapshot.clients {
        sqlx::query(
            r#"
            INSERT INTO clients (id, afm, eponimia, email, phone, notes, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(client.id)
        .bind(&client.afm)
        .bind(&client.eponimia)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(&client.notes)
        .bind(client.active)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    // Types may follow each other; insert them all first, then wire the
    // references.
    for ty in &snapshot.obligation_types {
        sqlx::query(
            r#"
            INSERT INTO obligation_types (
                id, code, name, frequency, deadline_type, deadline_day,
                follows_type_id, exclusion_group_id, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9, $9)
            "#,
        )
        .bind(ty.id)
        .bind(&ty.code)
        .bind(&ty.name)
        .bind(ty.frequency.as_str())
        .bind(ty.deadline_type.as_str())
        .bind(ty.deadline_day.map(|d| d as i32))
        .bind(ty.exclusion_group_id)
        .bind(ty.is_active)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }
    for ty in &snapshot.obligation_types {
        if let Some(follows) = ty.follows_type_id {
            sqlx::query("UPDATE obligation_types SET follows_type_id = $2 WHERE id = $1")
                .bind(ty.id)
                .bind(follows)
                .execute(&mut *tx)
                .await
                .map_err(internal_error)?;
        }
    }

    for profile in &snapshot.obligation_profiles {
        sqlx::query(
            r#"
            INSERT INTO obligation_profiles (id, name, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
        for (position, type_id) in profile.type_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO obligation_profile_members (profile_id, obligation_type_id, position)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(profile.id)
            .bind(type_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;
        }
    }

    for selection in &snapshot.client_type_selections {
        sqlx::query(
            r#"
            INSERT INTO client_obligation_types (client_id, obligation_type_id, assigned_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(selection.client_id)
        .bind(selection.obligation_type_id)
        .bind(selection.assigned_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }
    for selection in &snapshot.client_profile_selections {
        sqlx::query(
            r#"
            INSERT INTO client_obligation_profiles (client_id, obligation_profile_id, assigned_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(selection.client_id)
        .bind(selection.obligation_profile_id)
        .bind(selection.assigned_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    for obligation in &snapshot.obligations {
        sqlx::query(
            r#"
            INSERT INTO obligations (
                id, client_id, obligation_type_id, period_month, period_year,
                deadline, status, completed_date, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(obligation.id)
        .bind(obligation.client_id)
        .bind(obligation.obligation_type_id)
        .bind(obligation.period_month as i32)
        .bind(obligation.period_year)
        .bind(obligation.deadline)
        .bind(obligation.status.as_str())
        .bind(obligation.completed_date)
        .bind(&obligation.notes)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    for document in &snapshot.documents {
        sqlx::query(
            r#"
            INSERT INTO documents (id, client_id, file_name, category, stored_path, size_bytes, notes, uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(document.id)
        .bind(document.client_id)
        .bind(&document.file_name)
        .bind(&document.category)
        .bind(&document.stored_path)
        .bind(document.size_bytes)
        .bind(&document.notes)
        .bind(document.uploaded_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    for template in &snapshot.email_templates {
        sqlx::query(
            r#"
            INSERT INTO email_templates (id, name, subject, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    for log in &snapshot.email_logs {
        sqlx::query(
            r#"
            INSERT INTO email_logs (id, client_id, template_id, recipient, subject, body, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(log.client_id)
        .bind(log.template_id)
        .bind(&log.recipient)
        .bind(&log.subject)
        .bind(&log.body)
        .bind(log.sent_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    for ticket in &snapshot.tickets {
        sqlx::query(
            r#"
            INSERT INTO tickets (id, client_id, subject, description, status, priority, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.client_id)
        .bind(&ticket.subject)
        .bind(&ticket.description)
        .bind(&ticket.status)
        .bind(&ticket.priority)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    for call in &snapshot.call_logs {
        sqlx::query(
            r#"
            INSERT INTO call_logs (id, client_id, direction, caller_number, duration_secs, notes, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(call.id)
        .bind(call.client_id)
        .bind(&call.direction)
        .bind(&call.caller_number)
        .bind(call.duration_secs)
        .bind(&call.notes)
        .bind(call.occurred_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    }

    tx.commit().await.map_err(internal_error)?;
    Ok(())
}

// ----------------------------------------------------------- shared bits

async fn fetch_client(pool: &PgPool, client_id: Uuid) -> Result<Client, (StatusCode, String)> {
    let row = sqlx::query(
        "SELECT id, afm, eponimia, email, phone, notes, active, created_at, updated_at FROM clients WHERE id = $1",
    )
    .bind(client_id)
    .fetch_optional(pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(not_found)?;

    client_from_row(&row).map_err(internal_error)
}

async fn load_types(pool: &PgPool) -> Result<Vec<ObligationType>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT id, code, name, frequency, deadline_type, deadline_day,
               follows_type_id, exclusion_group_id, is_active
        FROM obligation_types
        ORDER BY code ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(internal_error)?;

    let mut types = Vec::with_capacity(rows.len());
    for row in rows {
        types.push(obligation_type_from_row(&row).map_err(internal_error)?);
    }
    Ok(types)
}

async fn load_types_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<Vec<ObligationType>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT id, code, name, frequency, deadline_type, deadline_day,
               follows_type_id, exclusion_group_id, is_active
        FROM obligation_types
        ORDER BY code ASC
        "#,
    )
    .fetch_all(&mut **tx)
    .await
    .map_err(internal_error)?;

    let mut types = Vec::with_capacity(rows.len());
    for row in rows {
        types.push(obligation_type_from_row(&row).map_err(internal_error)?);
    }
    Ok(types)
}

async fn load_type_catalog(pool: &PgPool) -> Result<TypeCatalog, (StatusCode, String)> {
    let types = load_types(pool).await?;
    Ok(TypeCatalog::new(
        types.iter().map(|ty| (ty.id, ty.exclusion_group_id)),
    ))
}

async fn load_selected_type_ids(
    pool: &PgPool,
    client_id: Uuid,
) -> Result<Vec<Uuid>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT obligation_type_id
        FROM client_obligation_types
        WHERE client_id = $1
        ORDER BY assigned_at ASC, obligation_type_id ASC
        "#,
    )
    .bind(client_id)
    .fetch_all(pool)
    .await
    .map_err(internal_error)?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        ids.push(row.try_get("obligation_type_id").map_err(internal_error)?);
    }
    Ok(ids)
}

async fn load_selected_profile_ids(
    pool: &PgPool,
    client_id: Uuid,
) -> Result<Vec<Uuid>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT obligation_profile_id
        FROM client_obligation_profiles
        WHERE client_id = $1
        ORDER BY assigned_at ASC, obligation_profile_id ASC
        "#,
    )
    .bind(client_id)
    .fetch_all(pool)
    .await
    .map_err(internal_error)?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        ids.push(row.try_get("obligation_profile_id").map_err(internal_error)?);
    }
    Ok(ids)
}

async fn ensure_types_exist(
    pool: &PgPool,
    type_ids: &[Uuid],
) -> Result<(), (StatusCode, String)> {
    let unique = dedup_preserving_order(type_ids);
    if unique.is_empty() {
        return Ok(());
    }
    let rows = sqlx::query("SELECT id FROM obligation_types WHERE id = ANY($1)")
        .bind(&unique)
        .fetch_all(pool)
        .await
        .map_err(internal_error)?;
    if rows.len() != unique.len() {
        return Err(bad_request("one or more obligation type ids are unknown"));
    }
    Ok(())
}

async fn ensure_profiles_exist(
    pool: &PgPool,
    profile_ids: &[Uuid],
) -> Result<(), (StatusCode, String)> {
    let unique = dedup_preserving_order(profile_ids);
    if unique.is_empty() {
        return Ok(());
    }
    let rows = sqlx::query("SELECT id FROM obligation_profiles WHERE id = ANY($1)")
        .bind(&unique)
        .fetch_all(pool)
        .await
        .map_err(internal_error)?;
    if rows.len() != unique.len() {
        return Err(bad_request("one or more obligation profile ids are unknown"));
    }
    Ok(())
}

fn client_from_row(row: &PgRow) -> Result<Client, sqlx::Error> {
    Ok(Client {
        id: row.try_get("id")?,
        afm: row.try_get("afm")?,
        eponimia: row.try_get("eponimia")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        notes: row.try_get("notes")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn obligation_type_from_row(row: &PgRow) -> AnyResult<ObligationType> {
    let frequency: String = row.try_get("frequency")?;
    let deadline_type: String = row.try_get("deadline_type")?;
    let deadline_day: Option<i32> = row.try_get("deadline_day")?;
    Ok(ObligationType {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        frequency: Frequency::parse(&frequency)?,
        deadline_type: DeadlineType::parse(&deadline_type)?,
        deadline_day: deadline_day.map(|d| d as u32),
        follows_type_id: row.try_get("follows_type_id")?,
        exclusion_group_id: row.try_get("exclusion_group_id")?,
        is_active: row.try_get("is_active")?,
    })
}

fn obligation_from_row(row: &PgRow) -> AnyResult<Obligation> {
    let status: String = row.try_get("status")?;
    let period_month: i32 = row.try_get("period_month")?;
    Ok(Obligation {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        obligation_type_id: row.try_get("obligation_type_id")?,
        period_month: period_month as u32,
        period_year: row.try_get("period_year")?,
        deadline: row.try_get("deadline")?,
        status: ObligationStatus::parse(&status)?,
        completed_date: row.try_get("completed_date")?,
        notes: row.try_get("notes")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document, sqlx::Error> {
    Ok(Document {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        file_name: row.try_get("file_name")?,
        category: row.try_get("category")?,
        stored_path: row.try_get("stored_path")?,
        size_bytes: row.try_get("size_bytes")?,
        notes: row.try_get("notes")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

fn email_template_from_row(row: &PgRow) -> Result<EmailTemplate, sqlx::Error> {
    Ok(EmailTemplate {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
    })
}

fn email_log_from_row(row: &PgRow) -> Result<EmailLog, sqlx::Error> {
    Ok(EmailLog {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        template_id: row.try_get("template_id")?,
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        sent_at: row.try_get("sent_at")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket, sqlx::Error> {
    Ok(Ticket {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        subject: row.try_get("subject")?,
        description: row.try_get("description")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn call_log_from_row(row: &PgRow) -> Result<CallLog, sqlx::Error> {
    Ok(CallLog {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        direction: row.try_get("direction")?,
        caller_number: row.try_get("caller_number")?,
        duration_secs: row.try_get("duration_secs")?,
        notes: row.try_get("notes")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn client_view(client: Client) -> ClientView {
    ClientView {
        id: client.id,
        afm: client.afm,
        eponimia: client.eponimia,
        email: client.email,
        phone: client.phone,
        notes: client.notes,
        active: client.active,
        created_at: client.created_at,
        updated_at: client.updated_at,
    }
}

fn obligation_type_view(ty: ObligationType) -> ObligationTypeView {
    ObligationTypeView {
        id: ty.id,
        code: ty.code,
        name: ty.name,
        frequency: ty.frequency.as_str().to_string(),
        deadline_type: ty.deadline_type.as_str().to_string(),
        deadline_day: ty.deadline_day.map(|d| d as i32),
        follows_type_id: ty.follows_type_id,
        exclusion_group_id: ty.exclusion_group_id,
        is_active: ty.is_active,
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

fn dedup_preserving_order(ids: &[Uuid]) -> Vec<Uuid> {
    let mut unique = Vec::with_capacity(ids.len());
    for &id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

fn normalize_ticket_status(value: &str) -> AnyResult<String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "open" | "in_progress" | "closed" => Ok(normalized),
        other => anyhow::bail!("unsupported ticket status: {other}"),
    }
}

fn normalize_priority(value: &str) -> AnyResult<String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "low" | "normal" | "high" => Ok(normalized),
        other => anyhow::bail!("unsupported priority: {other}"),
    }
}

fn normalize_direction(value: &str) -> AnyResult<String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "inbound" | "outbound" => Ok(normalized),
        other => anyhow::bail!("unsupported call direction: {other}"),
    }
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "not found".to_string())
}

// The full error goes to the log only; driver errors can carry SQL text
// and connection details that must not reach the client.
fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    error!("request failed: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_optional_blank_becomes_none() {
        assert_eq!(normalize_optional(Some("  ".to_string())), None);
        assert_eq!(
            normalize_optional(Some(" x ".to_string())),
            Some("x".to_string())
        );
        assert_eq!(normalize_optional(None), None);
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedup_preserving_order(&[a, b, a, b, a]), vec![a, b]);
    }

    #[test]
    fn ticket_status_and_priority_are_normalized() {
        assert_eq!(normalize_ticket_status(" OPEN ").unwrap(), "open");
        assert!(normalize_ticket_status("resolved").is_err());
        assert_eq!(normalize_priority("High").unwrap(), "high");
        assert!(normalize_priority("urgent").is_err());
    }

    #[test]
    fn internal_errors_never_leak_detail_to_the_client() {
        let (status, body) = internal_error("error connecting to postgres://user:secret@db/crm");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "internal error");
    }

    #[test]
    fn call_direction_is_normalized() {
        assert_eq!(normalize_direction("Inbound").unwrap(), "inbound");
        assert!(normalize_direction("missed").is_err());
    }
}
