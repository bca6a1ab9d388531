pub mod rbac;
pub mod user;
pub mod workflow;
