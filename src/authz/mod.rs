//! Authorization: principals, the policy evaluator, and well-known names.

mod evaluator;
mod principal;

pub use evaluator::{DefaultPolicyEvaluator, PolicyEvaluator};
pub use principal::Principal;

/// Standing banking roles seeded by the migrations.
pub mod roles {
    pub const BACK_OFFICE_OFFICER: &str = "BackOfficeOfficer";
    pub const LOAN_OFFICER: &str = "LoanOfficer";
    pub const BANCASSURANCE_OFFICER: &str = "BancassuranceOfficer";
    pub const BRANCH_MANAGER: &str = "BranchManager";
    pub const REGIONAL_MANAGER: &str = "RegionalManager";
    pub const HEAD_OFFICE: &str = "HeadOffice";
    pub const ADMINISTRATOR: &str = "Administrator";
}

/// Resource and action tags.
pub mod permissions {
    pub const WORKFLOW: &str = "Workflow";
    pub const ROLE: &str = "Role";

    pub const INITIATE: &str = "Initiate";
    pub const APPROVE: &str = "Approve";
    pub const REJECT: &str = "Reject";
    pub const CANCEL: &str = "Cancel";
    pub const ESCALATE: &str = "Escalate";
    pub const VIEW: &str = "View";
    pub const MANAGE: &str = "Manage";
}
