//! Sandboxed script engine.
//!
//! This module wraps a `rhai` engine configured for untrusted tenant code:
//! hard operation and call-depth budgets, a string size cap, and no access to
//! anything except the host functions registered here. A plain `Engine::new()`
//! already has no filesystem or module loading wired up; the host functions
//! below are the entire outside surface a script can reach.

use rhai::{Dynamic, EvalAltResult, Position, Scope};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use tokenweave_core::config::SandboxConfig;
use tokenweave_core::{AuditEntry, AuditSink, AuthzClient, Error, Result, SecretResolver};

// =============================================================================
// Host Capabilities
// =============================================================================

/// Collaborators exposed to scripts as host functions.
///
/// Every field is optional; a missing collaborator makes the corresponding
/// host function degrade (deny, empty string, or no-op) rather than fail the
/// whole script.
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub authz: Option<Arc<dyn AuthzClient>>,
    pub secrets: Option<Arc<dyn SecretResolver>>,
    pub audit: Option<Arc<dyn AuditSink>>,
}

/// Convert a host-side failure into a script runtime error.
fn host_error(err: impl ToString) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        err.to_string().into(),
        Position::NONE,
    ))
}

// =============================================================================
// Script Engine
// =============================================================================

/// A single reusable script engine with captured console output and a use
/// counter for pool recycling.
pub struct ScriptEngine {
    engine: rhai::Engine,
    console: Arc<Mutex<String>>,
    uses: u32,
}

impl ScriptEngine {
    pub fn new(capabilities: &HostCapabilities, config: &SandboxConfig) -> Self {
        let mut engine = rhai::Engine::new();
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_string_size(config.max_string_size);

        let console = Arc::new(Mutex::new(String::new()));
        register_host_functions(&mut engine, capabilities, &console, config);

        Self {
            engine,
            console,
            uses: 0,
        }
    }

    /// Compile `source` and call the named function with the given arguments.
    pub fn run_function(&self, source: &str, name: &str, args: Vec<Dynamic>) -> Result<Dynamic> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| Error::script_execution(format!("compile error: {e}")))?;
        let mut scope = Scope::new();
        self.engine
            .call_fn::<Dynamic>(&mut scope, &ast, name, args)
            .map_err(|e| Error::script_execution(e.to_string()))
    }

    /// Everything the script printed since the last [`Self::begin_use`].
    pub fn console_output(&self) -> String {
        self.console
            .lock()
            .map(|console| console.clone())
            .unwrap_or_default()
    }

    /// Drop any captured console output. Callers holding an engine across
    /// batches clear between uses; [`Self::begin_use`] also clears on acquire.
    pub fn clear_console(&self) {
        if let Ok(mut console) = self.console.lock() {
            console.clear();
        }
    }

    /// How many times this engine has been handed out.
    pub fn uses(&self) -> u32 {
        self.uses
    }

    /// Mark the engine as handed out and clear state left by the previous user.
    pub(crate) fn begin_use(&mut self) {
        self.uses += 1;
        self.clear_console();
    }
}

// =============================================================================
// Host Functions
// =============================================================================

fn register_host_functions(
    engine: &mut rhai::Engine,
    capabilities: &HostCapabilities,
    console: &Arc<Mutex<String>>,
    config: &SandboxConfig,
) {
    let buffer = Arc::clone(console);
    engine.on_print(move |text| {
        if let Ok(mut buffer) = buffer.lock() {
            buffer.push_str(text);
            buffer.push('\n');
        }
    });

    let authz = capabilities.authz.clone();
    engine.register_fn(
        "check_attribute",
        move |id1: &str, id2: &str, attribute: &str| -> std::result::Result<bool, Box<EvalAltResult>> {
            let Some(client) = authz.as_ref() else {
                tracing::error!("check_attribute called without an authz client");
                return Ok(false);
            };
            let id1 = Uuid::parse_str(id1).map_err(host_error)?;
            let id2 = Uuid::parse_str(id2).map_err(host_error)?;
            client.check_attribute(id1, id2, attribute).map_err(host_error)
        },
    );

    let secrets = capabilities.secrets.clone();
    engine.register_fn(
        "get_secret",
        move |name: &str| -> std::result::Result<String, Box<EvalAltResult>> {
            let Some(resolver) = secrets.as_ref() else {
                tracing::warn!(name, "get_secret called without a secret resolver");
                return Ok(String::new());
            };
            resolver.resolve_secret(name).map_err(host_error)
        },
    );

    let audit = capabilities.audit.clone();
    engine.register_fn("audit_log", move |message: &str| {
        let Some(sink) = audit.as_ref() else {
            tracing::warn!("audit_log called without an audit sink");
            return;
        };
        sink.emit(AuditEntry::new(
            "sandbox",
            "script_audit_log",
            json!({ "message": message }),
        ));
    });

    engine.register_fn(
        "get_country_for_phone_number",
        |number: &str| -> std::result::Result<rhai::Map, Box<EvalAltResult>> {
            let parsed = phonenumber::parse(None, number).map_err(host_error)?;
            let mut result = rhai::Map::new();
            let alpha_2 = parsed
                .country()
                .id()
                .map(|id| format!("{id:?}"))
                .unwrap_or_default();
            result.insert("alpha_2".into(), alpha_2.into());
            result.insert(
                "country_code".into(),
                Dynamic::from(i64::from(parsed.country().code())),
            );
            Ok(result)
        },
    );

    let http_timeout = Duration::from_millis(config.http_timeout_ms);
    engine.register_fn(
        "network_request",
        move |options: rhai::Map| -> std::result::Result<String, Box<EvalAltResult>> {
            network_request(&options, http_timeout)
        },
    );
}

fn map_string(options: &rhai::Map, key: &str) -> Option<String> {
    options.get(key).and_then(|v| v.clone().into_string().ok())
}

/// Outbound HTTP on behalf of a script. Options: `method`, `url`, and
/// optionally `body`, `headers` (string map), `auth` (`user` / `password`).
/// Returns the response body as a string.
fn network_request(
    options: &rhai::Map,
    timeout: Duration,
) -> std::result::Result<String, Box<EvalAltResult>> {
    let method = map_string(options, "method")
        .ok_or_else(|| host_error("network_request requires a string `method`"))?;
    let url = map_string(options, "url")
        .ok_or_else(|| host_error("network_request requires a string `url`"))?;
    let method =
        reqwest::Method::from_bytes(method.to_uppercase().as_bytes()).map_err(host_error)?;

    tracing::debug!(%method, %url, "script network request");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(host_error)?;
    let mut request = client.request(method, url);

    if let Some(body) = map_string(options, "body") {
        request = request.body(body);
    }
    if let Some(headers) = options.get("headers").and_then(|v| v.clone().try_cast::<rhai::Map>()) {
        for (name, value) in &headers {
            let value = value
                .clone()
                .into_string()
                .map_err(|_| host_error(format!("header `{name}` is not a string")))?;
            request = request.header(name.as_str(), value);
        }
    }
    if let Some(auth) = options.get("auth").and_then(|v| v.clone().try_cast::<rhai::Map>()) {
        let user = map_string(&auth, "user").unwrap_or_default();
        let password = map_string(&auth, "password");
        request = request.basic_auth(user, password);
    }

    let response = request.send().map_err(host_error)?;
    response.text().map_err(host_error)
}
