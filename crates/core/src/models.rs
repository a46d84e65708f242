//! Data model for access policies, templates, transformers, and token records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Well-known object IDs baked into every tenant.
pub mod ids {
    use uuid::Uuid;

    /// Template that admits every request.
    pub const ALLOW_ALL_TEMPLATE: Uuid = Uuid::from_u128(0x1e3e9bcb_6b3a_4a4b_8c0f_32d1a2f0a1c4);

    /// Template that denies every request.
    pub const DENY_ALL_TEMPLATE: Uuid = Uuid::from_u128(0x8a2d0b52_4f1e_49bd_9c0a_6f5dd4a7e3b9);

    /// Template that consults the authorization service for an attribute edge.
    pub const CHECK_ATTRIBUTE_TEMPLATE: Uuid =
        Uuid::from_u128(0xaad2bf25_3c1a_4a9b_b1d4_7f0e2a9c5d11);

    /// Transformer that returns its input unchanged.
    pub const PASSTHROUGH_TRANSFORMER: Uuid =
        Uuid::from_u128(0xc0b5f1de_2a44_4d0a_9e8b_3f6c1d2e4a57);

    /// Transformer that emits a random UUID token.
    pub const UUID_TRANSFORMER: Uuid = Uuid::from_u128(0x67f2b1a0_5c3d_4e6f_8a9b_0c1d2e3f4a5b);

    /// Sentinel entity under which token resolution rate limits are counted,
    /// so that resolution traffic shares one budget across all access policies.
    pub const TOKEN_RESOLUTION: Uuid = Uuid::from_u128(0x416ad6d5_1062_4043_b0be_e583d0c843fb);
}

/// Rate limit subject used when a request carries neither token claims nor a
/// connection identity.
pub const GLOBAL_RATE_SUBJECT: &str = "global";

// =============================================================================
// Access Policies
// =============================================================================

/// Boolean combinator applied across a policy's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    CompositeAnd,
    CompositeOr,
}

/// One component of a composite access policy: either a nested policy or a
/// template invocation with its JSON parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicyComponent {
    Policy {
        id: Uuid,
    },
    Template {
        id: Uuid,
        #[serde(default)]
        parameters: String,
    },
}

impl AccessPolicyComponent {
    pub fn policy(id: Uuid) -> Self {
        Self::Policy { id }
    }

    pub fn template(id: Uuid, parameters: impl Into<String>) -> Self {
        Self::Template {
            id,
            parameters: parameters.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Policy { id } => {
                if id.is_nil() {
                    return Err(Error::validation("policy component has a nil policy ID"));
                }
            }
            Self::Template { id, parameters } => {
                if id.is_nil() {
                    return Err(Error::validation("template component has a nil template ID"));
                }
                if !parameters.is_empty()
                    && serde_json::from_str::<Map<String, Value>>(parameters).is_err()
                {
                    return Err(Error::validation(format!(
                        "template component {id} parameters are not a JSON object"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Execution thresholds attached to an access policy.
///
/// A zero value disables the corresponding limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicyThresholds {
    /// Surface rate limit hits to the caller as errors instead of failed results.
    pub announce_max_execution_failure: bool,
    /// Surface result limit hits to the caller as errors instead of failed results.
    pub announce_max_result_failure: bool,
    /// Maximum number of policy executions within the sliding window.
    pub max_executions: u32,
    /// Width of the execution rate window, in seconds.
    pub max_execution_duration_secs: u32,
    /// Maximum number of successful resolutions per execution.
    pub max_results_per_execution: u32,
}

impl AccessPolicyThresholds {
    /// True when an execution rate limit is configured.
    pub fn has_rate_limit(&self) -> bool {
        self.max_executions > 0
    }

    /// True when `count` resolutions are still within the per-execution result cap.
    pub fn within_result_threshold(&self, count: u64) -> bool {
        self.max_results_per_execution == 0 || count <= u64::from(self.max_results_per_execution)
    }

    pub fn validate(&self) -> Result<()> {
        if self.has_rate_limit()
            && !(5..=60).contains(&self.max_execution_duration_secs)
        {
            return Err(Error::validation(format!(
                "max_execution_duration_secs must be between 5 and 60, got {}",
                self.max_execution_duration_secs
            )));
        }
        Ok(())
    }
}

/// A composite access policy: an ordered list of components combined with a
/// single boolean operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub policy_type: PolicyType,
    pub version: i32,
    pub components: Vec<AccessPolicyComponent>,
    /// Context keys this policy expects, mapped to human-readable descriptions.
    #[serde(default)]
    pub required_context: BTreeMap<String, String>,
    #[serde(default)]
    pub thresholds: AccessPolicyThresholds,
}

impl AccessPolicy {
    pub fn new(
        name: impl Into<String>,
        policy_type: PolicyType,
        components: Vec<AccessPolicyComponent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            policy_type,
            version: 0,
            components,
            required_context: BTreeMap::new(),
            thresholds: AccessPolicyThresholds::default(),
        }
    }

    /// A composite OR policy wrapping the allow-all template.
    pub fn allow_all() -> Self {
        let mut policy = Self::new(
            "AllowAll",
            PolicyType::CompositeOr,
            vec![AccessPolicyComponent::template(ids::ALLOW_ALL_TEMPLATE, "")],
        );
        policy.description = "Allows all access".into();
        policy
    }

    /// A composite AND policy wrapping the deny-all template.
    pub fn deny_all() -> Self {
        let mut policy = Self::new(
            "DenyAll",
            PolicyType::CompositeAnd,
            vec![AccessPolicyComponent::template(ids::DENY_ALL_TEMPLATE, "")],
        );
        policy.description = "Denies all access".into();
        policy
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::validation("access policy ID must be set"));
        }
        if self.name.is_empty() {
            return Err(Error::validation("access policy name must be set"));
        }
        if self.components.is_empty() {
            return Err(Error::validation(format!(
                "access policy {} must have at least one component",
                self.name
            )));
        }
        for component in &self.components {
            component.validate()?;
        }
        self.thresholds.validate()
    }
}

/// A parameterized policy template: either one of the native built-ins or a
/// tenant-authored script exposing `fn policy(context, params)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicyTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub function: String,
    pub version: i32,
    #[serde(default)]
    pub required_context: BTreeMap<String, String>,
}

impl AccessPolicyTemplate {
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            function: function.into(),
            version: 0,
            required_context: BTreeMap::new(),
        }
    }

    pub fn allow_all() -> Self {
        Self {
            id: ids::ALLOW_ALL_TEMPLATE,
            name: "AllowAll".into(),
            description: "Template that allows all access".into(),
            function: "fn policy(context, params) { true }".into(),
            version: 0,
            required_context: BTreeMap::new(),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            id: ids::DENY_ALL_TEMPLATE,
            name: "DenyAll".into(),
            description: "Template that denies all access".into(),
            function: "fn policy(context, params) { false }".into(),
            version: 0,
            required_context: BTreeMap::new(),
        }
    }

    pub fn check_attribute() -> Self {
        Self {
            id: ids::CHECK_ATTRIBUTE_TEMPLATE,
            name: "CheckAttribute".into(),
            description: "Template that checks for an attribute edge between two objects".into(),
            function: "fn policy(context, params) { check_attribute(params.id1, params.id2, params.attribute) }".into(),
            version: 0,
            required_context: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::validation("access policy template ID must be set"));
        }
        if self.name.is_empty() {
            return Err(Error::validation("access policy template name must be set"));
        }
        if self.function.is_empty() {
            return Err(Error::validation(format!(
                "access policy template {} function must be set",
                self.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Transformers
// =============================================================================

/// What a transformer does with its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    /// Return the data unchanged.
    PassThrough,
    /// Irreversibly transform the data.
    Transform,
    /// Produce a token resolvable back to the original value.
    TokenizeByValue,
    /// Produce a token resolvable through a data provenance reference.
    TokenizeByReference,
}

impl TransformType {
    /// True when executing this transformer persists token records.
    pub fn is_tokenizing(&self) -> bool {
        matches!(self, Self::TokenizeByValue | Self::TokenizeByReference)
    }
}

/// A data transformation function, optionally tokenizing its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformer {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub function: String,
    /// JSON object passed to the function as its second argument.
    #[serde(default)]
    pub parameters: String,
    pub transform_type: TransformType,
    /// Reuse an existing token for the same (data, policy) pair instead of
    /// minting a new one.
    #[serde(default)]
    pub reuse_existing_token: bool,
    pub version: i32,
}

impl Transformer {
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        transform_type: TransformType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            function: function.into(),
            parameters: String::new(),
            transform_type,
            reuse_existing_token: false,
            version: 0,
        }
    }

    pub fn passthrough() -> Self {
        Self {
            id: ids::PASSTHROUGH_TRANSFORMER,
            name: "PassthroughUnchangedData".into(),
            description: "Returns the data unchanged".into(),
            function: "native".into(),
            parameters: String::new(),
            transform_type: TransformType::PassThrough,
            reuse_existing_token: false,
            version: 0,
        }
    }

    pub fn uuid_token() -> Self {
        Self {
            id: ids::UUID_TRANSFORMER,
            name: "UUID".into(),
            description: "Creates a UUID token".into(),
            function: "native".into(),
            parameters: String::new(),
            transform_type: TransformType::TokenizeByValue,
            reuse_existing_token: false,
            version: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::validation("transformer ID must be set"));
        }
        if self.name.is_empty() {
            return Err(Error::validation("transformer name must be set"));
        }
        if self.function.is_empty() {
            return Err(Error::validation(format!(
                "transformer {} function must be set",
                self.name
            )));
        }
        if !self.parameters.is_empty()
            && serde_json::from_str::<Value>(&self.parameters).is_err()
        {
            return Err(Error::validation(format!(
                "transformer {} parameters are not valid JSON",
                self.name
            )));
        }
        if self.reuse_existing_token && !self.transform_type.is_tokenizing() {
            return Err(Error::validation(format!(
                "transformer {} cannot reuse tokens without a tokenizing transform type",
                self.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Token Records
// =============================================================================

/// Reference to the origin of a piece of data, used by reference tokens in
/// place of an inline value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProvenance {
    pub user_id: Uuid,
    pub column_id: Uuid,
}

/// A persisted token and the data or provenance it stands for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Uuid,
    pub token: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub provenance: Option<DataProvenance>,
    pub transformer_id: Uuid,
    pub transformer_version: i32,
    pub access_policy_id: Uuid,
    pub access_policy_version: i32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl TokenRecord {
    /// A value token: the original data is stored inline.
    pub fn by_value(
        token: impl Into<String>,
        data: impl Into<String>,
        transformer: &Transformer,
        access_policy: &AccessPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            token: token.into(),
            data: data.into(),
            provenance: None,
            transformer_id: transformer.id,
            transformer_version: transformer.version,
            access_policy_id: access_policy.id,
            access_policy_version: access_policy.version,
            created: now,
            updated: now,
        }
    }

    /// A reference token: the data lives elsewhere and is identified by provenance.
    pub fn by_reference(
        token: impl Into<String>,
        provenance: DataProvenance,
        transformer: &Transformer,
        access_policy: &AccessPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            token: token.into(),
            data: String::new(),
            provenance: Some(provenance),
            transformer_id: transformer.id,
            transformer_version: transformer.version,
            access_policy_id: access_policy.id,
            access_policy_version: access_policy.version,
            created: now,
            updated: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::validation("token record token must be set"));
        }
        if self.transformer_id.is_nil() {
            return Err(Error::validation("token record transformer ID must be set"));
        }
        if self.access_policy_id.is_nil() {
            return Err(Error::validation(
                "token record access policy ID must be set",
            ));
        }
        match (&self.provenance, self.data.is_empty()) {
            (Some(_), false) => Err(Error::validation(
                "token record cannot carry both inline data and provenance",
            )),
            (None, true) => Err(Error::validation(
                "token record must carry either inline data or provenance",
            )),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Evaluation Context
// =============================================================================

/// The operation a policy evaluation is gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Resolve,
    Inspect,
    Lookup,
    Delete,
    Execute,
}

impl Default for Action {
    fn default() -> Self {
        Self::Execute
    }
}

/// The authenticated subject on whose behalf an evaluation runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectContext {
    pub id: Uuid,
    #[serde(default)]
    pub profile: Map<String, Value>,
}

/// Server-populated evaluation context: trusted facts about the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerContext {
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Verified claims from the caller's access token.
    #[serde(default)]
    pub claims: Map<String, Value>,
    #[serde(default)]
    pub action: Action,
    /// The authenticated client connection, when one exists.
    #[serde(default)]
    pub connection_id: Option<Uuid>,
    #[serde(default)]
    pub user: Option<SubjectContext>,
}

/// Full evaluation context handed to policy scripts: a caller-supplied client
/// section plus the trusted server section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicyContext {
    #[serde(default)]
    pub client: Map<String, Value>,
    #[serde(default)]
    pub server: ServerContext,
}
