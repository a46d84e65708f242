//! Template execution: native built-ins and sandboxed tenant scripts.
//!
//! A `TemplateExecutor` lives for one policy evaluation. It acquires a sandbox
//! engine lazily on the first script template it meets and holds it until
//! [`TemplateExecutor::cleanup`] or drop, so every template inside one
//! evaluation shares one engine and one console buffer.

use rhai::serde::to_dynamic;
use rhai::Dynamic;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use tokenweave_core::{
    ids, AccessPolicyContext, AccessPolicyTemplate, AuthzClient, Error, Result,
};
use tokenweave_sandbox::{EngineHandle, SandboxPool};

/// Name of the function every policy template script must expose.
pub const POLICY_FUNCTION: &str = "policy";

/// Built-in templates executed natively instead of through the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeTemplate {
    AllowAll,
    DenyAll,
    CheckAttribute,
}

/// Native implementation for a (template, version) pair, if one exists.
/// Updated versions of a built-in fall back to their script body.
pub fn native_template(id: Uuid, version: i32) -> Option<NativeTemplate> {
    if version != 0 {
        return None;
    }
    match id {
        ids::ALLOW_ALL_TEMPLATE => Some(NativeTemplate::AllowAll),
        ids::DENY_ALL_TEMPLATE => Some(NativeTemplate::DenyAll),
        ids::CHECK_ATTRIBUTE_TEMPLATE => Some(NativeTemplate::CheckAttribute),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct CheckAttributeParams {
    #[serde(default)]
    id1: String,
    #[serde(default)]
    id2: String,
    #[serde(default)]
    attribute: String,
}

/// Runs templates for a single policy evaluation.
pub struct TemplateExecutor {
    pool: Arc<SandboxPool>,
    authz: Arc<dyn AuthzClient>,
    handle: Option<EngineHandle>,
}

impl TemplateExecutor {
    pub fn new(pool: Arc<SandboxPool>, authz: Arc<dyn AuthzClient>) -> Self {
        Self {
            pool,
            authz,
            handle: None,
        }
    }

    /// Execute one template against the evaluation context.
    ///
    /// `serialized_context` is the JSON form of `context`, serialized once per
    /// evaluation by the caller rather than per template.
    pub async fn execute(
        &mut self,
        template: &AccessPolicyTemplate,
        context: &AccessPolicyContext,
        serialized_context: &str,
        parameters: &str,
    ) -> Result<bool> {
        if let Some(native) = native_template(template.id, template.version) {
            return Ok(self.execute_native(native, context, parameters));
        }

        if self.handle.is_none() {
            self.handle = Some(self.pool.acquire().await?);
        }
        let Some(engine) = self.handle.as_ref() else {
            return Err(Error::internal("template executor lost its engine"));
        };

        let context_value: Value = serde_json::from_str(serialized_context)?;
        let parameters_value: Value = if parameters.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(parameters).map_err(|e| {
                Error::validation(format!(
                    "template {} parameters are not valid JSON: {e}",
                    template.name
                ))
            })?
        };
        let args = vec![
            to_dynamic(&context_value).map_err(|e| Error::script_execution(e.to_string()))?,
            to_dynamic(&parameters_value).map_err(|e| Error::script_execution(e.to_string()))?,
        ];

        let result = engine.run_function(&template.function, POLICY_FUNCTION, args)?;
        Ok(coerce_bool(&result))
    }

    fn execute_native(
        &self,
        native: NativeTemplate,
        context: &AccessPolicyContext,
        parameters: &str,
    ) -> bool {
        match native {
            NativeTemplate::AllowAll => true,
            NativeTemplate::DenyAll => false,
            NativeTemplate::CheckAttribute => self.check_attribute(context, parameters),
        }
    }

    /// Native CheckAttribute. Any malformed input denies instead of erroring:
    /// a misconfigured policy must fail closed.
    fn check_attribute(&self, context: &AccessPolicyContext, parameters: &str) -> bool {
        let params: CheckAttributeParams = match serde_json::from_str(parameters) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(error = %e, "check_attribute parameters are not valid JSON");
                return false;
            }
        };
        if params.attribute.is_empty() {
            tracing::warn!("check_attribute called without an attribute");
            return false;
        }
        let (Some(id1), Some(id2)) = (
            resolve_object_id(&params.id1, context),
            resolve_object_id(&params.id2, context),
        ) else {
            return false;
        };
        match self.authz.check_attribute(id1, id2, &params.attribute) {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(error = %e, "check_attribute authz call failed");
                false
            }
        }
    }

    /// Script output printed so far in this evaluation.
    pub fn console_output(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.console_output())
            .unwrap_or_default()
    }

    /// Return the engine to the pool. Dropping the executor does the same.
    pub fn cleanup(&mut self) {
        self.handle = None;
    }
}

/// `$subject` (or an omitted ID) refers to the authenticated subject of the
/// evaluation; anything else must be a literal UUID.
fn resolve_object_id(raw: &str, context: &AccessPolicyContext) -> Option<Uuid> {
    if raw.is_empty() || raw == "$subject" {
        return context.server.user.as_ref().map(|user| user.id);
    }
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(raw, error = %e, "check_attribute object ID is not a UUID");
            None
        }
    }
}

/// Truthiness of a script result, for templates that do not return a strict
/// boolean: unit and zero are false, non-empty values are true.
fn coerce_bool(value: &Dynamic) -> bool {
    if let Ok(flag) = value.as_bool() {
        return flag;
    }
    if value.is_unit() {
        return false;
    }
    if let Ok(n) = value.as_int() {
        return n != 0;
    }
    if value.is_string() {
        return !value
            .clone()
            .into_string()
            .map(|s| s.is_empty())
            .unwrap_or(true);
    }
    value.is_map() || value.is_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokenweave_core::config::SandboxConfig;
    use tokenweave_core::mocks::MockAuthz;
    use tokenweave_core::{ServerContext, SubjectContext};
    use tokenweave_sandbox::HostCapabilities;

    fn executor(authz: Arc<MockAuthz>) -> TemplateExecutor {
        let pool = SandboxPool::new(HostCapabilities::default(), SandboxConfig::default());
        TemplateExecutor::new(pool, authz)
    }

    fn context_with_subject(id: Uuid) -> AccessPolicyContext {
        AccessPolicyContext {
            server: ServerContext {
                user: Some(SubjectContext {
                    id,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn run(
        executor: &mut TemplateExecutor,
        template: &AccessPolicyTemplate,
        context: &AccessPolicyContext,
        parameters: &str,
    ) -> Result<bool> {
        let serialized = serde_json::to_string(context).unwrap();
        executor
            .execute(template, context, &serialized, parameters)
            .await
    }

    #[tokio::test]
    async fn native_allow_and_deny() {
        let mut executor = executor(Arc::new(MockAuthz::allowing(true)));
        let context = AccessPolicyContext::default();
        assert!(run(
            &mut executor,
            &AccessPolicyTemplate::allow_all(),
            &context,
            ""
        )
        .await
        .unwrap());
        assert!(!run(
            &mut executor,
            &AccessPolicyTemplate::deny_all(),
            &context,
            ""
        )
        .await
        .unwrap());
    }

    #[tokio::test]
    async fn check_attribute_mirrors_authz_answer() {
        let params = json!({
            "id1": Uuid::new_v4().to_string(),
            "id2": Uuid::new_v4().to_string(),
            "attribute": "member",
        })
        .to_string();

        for answer in [true, false] {
            let authz = Arc::new(MockAuthz::allowing(answer));
            let mut executor = executor(authz.clone());
            let allowed = run(
                &mut executor,
                &AccessPolicyTemplate::check_attribute(),
                &AccessPolicyContext::default(),
                &params,
            )
            .await
            .unwrap();
            assert_eq!(allowed, answer);
            assert_eq!(authz.call_count(), 1);
        }
    }

    #[tokio::test]
    async fn check_attribute_substitutes_subject() {
        let authz = Arc::new(MockAuthz::allowing(true));
        let mut executor = executor(authz.clone());
        let subject = Uuid::new_v4();
        let params = json!({
            "id1": "$subject",
            "id2": Uuid::new_v4().to_string(),
            "attribute": "member",
        })
        .to_string();

        let allowed = run(
            &mut executor,
            &AccessPolicyTemplate::check_attribute(),
            &context_with_subject(subject),
            &params,
        )
        .await
        .unwrap();
        assert!(allowed);
        assert_eq!(authz.call_count(), 1);

        // No subject in context means the substitution fails closed.
        let denied = run(
            &mut executor,
            &AccessPolicyTemplate::check_attribute(),
            &AccessPolicyContext::default(),
            &params,
        )
        .await
        .unwrap();
        assert!(!denied);
        assert_eq!(authz.call_count(), 1);
    }

    #[tokio::test]
    async fn check_attribute_fails_closed_on_bad_input() {
        let authz = Arc::new(MockAuthz::allowing(true));
        let mut executor = executor(authz.clone());
        let context = AccessPolicyContext::default();
        let template = AccessPolicyTemplate::check_attribute();

        // Malformed JSON.
        assert!(!run(&mut executor, &template, &context, "{nope").await.unwrap());
        // Non-UUID object ID.
        let params = json!({"id1": "not-a-uuid", "id2": Uuid::new_v4().to_string(), "attribute": "member"}).to_string();
        assert!(!run(&mut executor, &template, &context, &params).await.unwrap());
        // Missing attribute.
        let params = json!({"id1": Uuid::new_v4().to_string(), "id2": Uuid::new_v4().to_string()}).to_string();
        assert!(!run(&mut executor, &template, &context, &params).await.unwrap());

        assert_eq!(authz.call_count(), 0);
    }

    #[tokio::test]
    async fn script_template_reads_client_context() {
        let mut executor = executor(Arc::new(MockAuthz::allowing(false)));
        let template = AccessPolicyTemplate::new(
            "ClientFlag",
            "fn policy(context, params) { context.client.value }",
        );

        for value in [true, false] {
            let mut context = AccessPolicyContext::default();
            context.client.insert("value".into(), json!(value));
            let allowed = run(&mut executor, &template, &context, "").await.unwrap();
            assert_eq!(allowed, value);
        }
    }

    #[tokio::test]
    async fn script_template_rejects_bad_parameters() {
        let mut executor = executor(Arc::new(MockAuthz::allowing(false)));
        let template =
            AccessPolicyTemplate::new("ParamEcho", "fn policy(context, params) { true }");
        let err = run(&mut executor, &template, &AccessPolicyContext::default(), "{broken")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn bool_coercion() {
        assert!(coerce_bool(&Dynamic::from(true)));
        assert!(!coerce_bool(&Dynamic::from(false)));
        assert!(!coerce_bool(&Dynamic::UNIT));
        assert!(!coerce_bool(&Dynamic::from(0_i64)));
        assert!(coerce_bool(&Dynamic::from(7_i64)));
        assert!(!coerce_bool(&Dynamic::from(String::new())));
        assert!(coerce_bool(&Dynamic::from("yes".to_string())));
    }
}
