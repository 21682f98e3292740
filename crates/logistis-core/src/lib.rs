pub mod assign;
pub mod deadline;
pub mod models;
pub mod selection;
pub mod template;

pub use assign::{AssignMode, AssignmentError, BulkPlan, ClientPlan, plan_bulk_assignment};
pub use deadline::{DeadlineError, deadline_for, due_in_month, month_deadline, resolve_deadline};
pub use models::{
    CallLog, Client, DeadlineType, Document, EmailLog, EmailTemplate, Frequency, Obligation,
    ObligationProfile, ObligationStatus, ObligationType, ParseError, Period, Ticket, valid_afm,
};
pub use selection::{
    NormalizedSelection, SelectionError, SelectionState, ToggleOutcome, TypeCatalog,
};
pub use template::{TemplateError, client_vars, render};
