use serde_json::Value;

#[test]
fn openapi_exposes_workflow_fields() -> anyhow::Result<()> {
    // Build the OpenAPI document the same way the server does
    let doc = dual_control::docs::build_openapi(8000)?;
    let v = serde_json::to_value(&doc)?;

    let props = v
        .get("components")
        .and_then(Value::as_object)
        .and_then(|c| c.get("schemas"))
        .and_then(Value::as_object)
        .and_then(|s| s.get("WorkflowInstance"))
        .and_then(Value::as_object)
        .and_then(|t| t.get("properties"))
        .and_then(Value::as_object)
        .expect("components.schemas.WorkflowInstance.properties must exist");

    let keys = ["status", "initiated_by", "approval_deadline", "amount", "version"];
    for k in &keys {
        assert!(props.contains_key(*k), "OpenAPI WorkflowInstance schema missing '{}'", k);
    }

    let paths = v.get("paths").and_then(Value::as_object).expect("paths must exist");
    for p in ["/workflows/{id}/approve", "/workflows/queue", "/rbac/users/{user_id}/authorize", "/auth/login"] {
        assert!(paths.contains_key(p), "OpenAPI missing path '{}'", p);
    }

    Ok(())
}
