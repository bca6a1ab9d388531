use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::models;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
	paths(
		routes::health::health,
		routes::auth::login,
		routes::auth::logout,
		routes::auth::me,
		routes::auth::session,
		routes::workflows::initiate_workflow,
		routes::workflows::list_workflows,
		routes::workflows::workflow_history,
		routes::workflows::get_workflow,
		routes::workflows::get_steps,
		routes::workflows::can_approve,
		routes::workflows::approve_workflow,
		routes::workflows::reject_workflow,
		routes::workflows::escalate_workflow,
		routes::workflows::cancel_workflow,
		routes::workflows::approval_queue,
		routes::workflows::approval_queue_by_role,
		routes::workflows::workflow_metrics,
		routes::workflows::validate_rules,
		routes::rbac::list_roles,
		routes::rbac::create_role,
		routes::rbac::get_role,
		routes::rbac::update_role,
		routes::rbac::delete_role,
		routes::rbac::get_users_in_role,
		routes::rbac::get_role_permissions,
		routes::rbac::assign_permission_to_role,
		routes::rbac::remove_permission_from_role,
		routes::rbac::list_permissions,
		routes::rbac::create_permission,
		routes::rbac::delete_permission,
		routes::rbac::get_user_roles,
		routes::rbac::assign_role_to_user,
		routes::rbac::remove_role_from_user,
		routes::rbac::get_user_permissions,
		routes::rbac::authorize_action,
		routes::rbac::enforce_approval_limits
	),
	components(
		schemas(
			routes::health::HealthResponse,
			routes::auth::MessageResponse,
			models::user::User,
			models::user::LoginRequest,
			models::user::AuthResult,
			models::user::SessionStatus,
			models::rbac::Role,
			models::rbac::Permission,
			models::rbac::RoleCreateRequest,
			models::rbac::RoleUpdateRequest,
			models::rbac::PermissionCreateRequest,
			models::rbac::AssignPermissionToRoleRequest,
			models::rbac::AssignRoleRequest,
			models::rbac::UserRoleAssignment,
			models::rbac::AuthorizeRequest,
			models::rbac::AuthorizeResponse,
			models::rbac::ApprovalLimitRequest,
			models::rbac::ApprovalRequirement,
			models::workflow::WorkflowStatus,
			models::workflow::StepStatus,
			models::workflow::Priority,
			models::workflow::WorkflowInstance,
			models::workflow::ApprovalStep,
			models::workflow::ApprovalResult,
			models::workflow::EscalationResult,
			models::workflow::ValidationResult,
			models::workflow::PendingApproval,
			models::workflow::WorkflowMetrics,
			models::workflow::InitiateWorkflowRequest,
			models::workflow::ApproveRequest,
			models::workflow::ReasonRequest,
			models::workflow::ValidateRulesRequest
		)
	),
	tags(
		(name = "Health", description = "Liveness and storage checks"),
		(name = "Auth", description = "Credential login and session checks"),
		(name = "Workflows", description = "Maker-checker approval workflows"),
		(name = "RBAC", description = "Roles, permissions and assignments")
	)
)]
pub struct ApiDoc;

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(ApiDoc::openapi())?;

	normalize_path_operations(&mut doc);
	ensure_security_components(&mut doc);
	ensure_servers(&mut doc, port);

	Ok(serde_json::from_value(doc)?)
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> Router {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.persist_authorization(true);

	let json_route = get(move || {
		let doc = doc.clone();
		async move { Json(doc) }
	});

	Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config))
}

fn normalize_path_operations(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		for item in paths.values_mut() {
			if let Some(ops) = item.as_object() {
				let normalized: Map<String, Value> =
					ops.iter().map(|(method, val)| (method.to_lowercase(), val.clone())).collect();
				*item = Value::Object(normalized);
			}
		}
	}
}

fn ensure_security_components(doc: &mut Value) {
	let Some(root) = doc.as_object_mut() else {
		return;
	};

	let components = root.entry("components").or_insert_with(|| Value::Object(Map::new()));
	let Some(components) = components.as_object_mut() else {
		return;
	};

	let schemes = components
		.entry("securitySchemes")
		.or_insert_with(|| Value::Object(Map::new()));
	if let Some(schemes) = schemes.as_object_mut() {
		schemes.insert(
			"bearerAuth".to_string(),
			json!({
				"type": "http",
				"scheme": "bearer",
				"bearerFormat": "JWT"
			}),
		);
	}
}

fn ensure_servers(doc: &mut Value, port: u16) {
	let server_url = format!("http://localhost:{port}");

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr.iter().any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn document_lists_workflow_paths_and_bearer_scheme() {
		let doc = serde_json::to_value(build_openapi(8000).unwrap()).unwrap();

		assert!(doc["paths"]["/workflows/{id}/approve"]["post"].is_object());
		assert!(doc["paths"]["/rbac/roles"]["get"].is_object());
		assert_eq!(doc["components"]["securitySchemes"]["bearerAuth"]["scheme"], "bearer");
		assert_eq!(doc["servers"][0]["url"], "http://localhost:8000");
	}
}
