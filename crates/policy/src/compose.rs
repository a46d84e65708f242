//! Composition-time validation of access policies.
//!
//! Recursion is forbidden at composition time rather than detected during
//! evaluation: a policy that references itself, directly or through any chain
//! of nested policies, is rejected before it is ever stored. The same walk
//! collects the union of required context keys across the whole composition,
//! so callers can see every key the policy may consult.

use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use tokenweave_core::{AccessPolicy, AccessPolicyComponent, Error, Result, Storage};

/// Validate `policy` and everything it references, returning the merged
/// required context of the full composition.
pub async fn validate_composition(
    storage: &Arc<dyn Storage>,
    policy: &AccessPolicy,
) -> Result<BTreeMap<String, String>> {
    policy.validate()?;
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    let mut required = policy.required_context.clone();
    walk(storage, policy, &mut visited, &mut stack, &mut required).await?;
    Ok(required)
}

/// Depth-first walk with an explicit recursion stack. `visited` prunes
/// diamonds; `stack` holds the policies on the current path, so hitting one
/// of them again is a cycle.
fn walk<'a>(
    storage: &'a Arc<dyn Storage>,
    policy: &'a AccessPolicy,
    visited: &'a mut HashSet<Uuid>,
    stack: &'a mut HashSet<Uuid>,
    required: &'a mut BTreeMap<String, String>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        visited.insert(policy.id);
        stack.insert(policy.id);

        for component in &policy.components {
            match component {
                AccessPolicyComponent::Policy { id } => {
                    if stack.contains(id) {
                        return Err(Error::validation(format!(
                            "access policy {} ({}) is part of a composition cycle",
                            policy.name, policy.id
                        )));
                    }
                    if visited.contains(id) {
                        continue;
                    }
                    let nested = storage.get_latest_access_policy(*id).await?;
                    nested.validate()?;
                    merge_required(required, &nested.required_context);
                    walk(storage, &nested, visited, stack, required).await?;
                }
                AccessPolicyComponent::Template { id, .. } => {
                    let template = storage.get_latest_template(*id).await?;
                    merge_required(required, &template.required_context);
                }
            }
        }

        stack.remove(&policy.id);
        Ok(())
    })
}

fn merge_required(into: &mut BTreeMap<String, String>, from: &BTreeMap<String, String>) {
    for (key, description) in from {
        into.entry(key.clone()).or_insert_with(|| description.clone());
    }
}
