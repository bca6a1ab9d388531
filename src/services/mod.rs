pub mod auth;
pub mod rbac;
pub mod sweep;
pub mod workflow;

pub use auth::Authenticator;
pub use rbac::AuthorizationService;
pub use sweep::EscalationSweeper;
pub use workflow::WorkflowEngine;
