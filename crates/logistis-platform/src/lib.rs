pub mod config;
pub mod contracts;
pub mod db;

pub use config::ServiceConfig;
pub use contracts::{
    BulkAssignRequest, BulkAssignResponse, ClientSelectionView, ClientView, CreateClientRequest,
    GenerateObligationsRequest, GenerateObligationsResponse, ObligationProfileView,
    ObligationTypeView, ObligationView, SaveClientSelectionRequest, SaveClientSelectionResponse,
    UpdateClientRequest, UpdateObligationStatusRequest, UpsertObligationProfileRequest,
    UpsertObligationTypeRequest,
};
pub use db::connect_database;
