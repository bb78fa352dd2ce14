//! Promotion-time preflight: verify the service account can list/watch the
//! managed type, optionally register the CRD, and reconcile the manager Role.
//!
//! A denied access review is fatal and actionable; misconfigured RBAC cannot
//! self-heal at runtime.

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info, warn};

use rudder_core::config::CrdDescriptor;
use rudder_core::{Error, Result};

/// Probe one verb against the managed type via SelfSubjectAccessReview.
async fn can_i(
    client: Client,
    crd: &CrdDescriptor,
    namespace: Option<&str>,
    verb: &str,
) -> Result<(bool, String)> {
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                group: Some(crd.group.clone()),
                resource: Some(crd.plural.clone()),
                verb: Some(verb.to_string()),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    let api: Api<SelfSubjectAccessReview> = Api::all(client);
    let created = api.create(&PostParams::default(), &review).await?;
    let status = created.status.unwrap_or_default();
    Ok((status.allowed, status.reason.unwrap_or_default()))
}

/// Fail fast before starting any watch if list or watch would 403.
pub async fn ensure_permissions(
    client: &Client,
    crd: &CrdDescriptor,
    namespace: Option<&str>,
) -> Result<()> {
    for verb in ["list", "watch"] {
        let (allowed, reason) = can_i(client.clone(), crd, namespace, verb).await?;
        if !allowed {
            return Err(Error::Permission {
                verb: verb.to_string(),
                plural: crd.plural.clone(),
                detail: if reason.is_empty() { "denied".to_string() } else { reason },
            });
        }
        debug!(verb, plural = %crd.plural, "access review passed");
    }
    Ok(())
}

/// Register the CRD when absent. An existing definition is left alone; shape
/// management for already-installed CRDs belongs to the manifest pipeline.
pub async fn ensure_crd(client: &Client, crd: &CrdDescriptor) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let name = crd.crd_name();
    if api.get_opt(&name).await?.is_some() {
        debug!(crd = %name, "definition already present");
        return Ok(());
    }
    let scope = if crd.namespaced() { "Namespaced" } else { "Cluster" };
    let definition: CustomResourceDefinition = serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": name },
        "spec": {
            "group": crd.group,
            "names": {
                "kind": crd.kind,
                "plural": crd.plural,
                "singular": crd.kind.to_lowercase(),
            },
            "scope": scope,
            "versions": [{
                "name": crd.version,
                "served": true,
                "storage": true,
                "schema": {
                    "openAPIV3Schema": {
                        "type": "object",
                        "x-kubernetes-preserve-unknown-fields": true,
                    }
                },
                "subresources": { "status": {} },
            }],
        },
    }))?;
    match api.create(&PostParams::default(), &definition).await {
        Ok(_) => {
            info!(crd = %name, "registered custom resource definition");
            Ok(())
        }
        // Another replica can win the create race between get and create.
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(crd = %name, "definition created concurrently");
            Ok(())
        }
        Err(err) => Err(Error::Api(err)),
    }
}

/// The verbs the manager Role grants on the managed type and its status
/// subresource.
pub fn manager_rules(crd: &CrdDescriptor) -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(vec![crd.group.clone()]),
        resources: Some(vec![crd.plural.clone(), format!("{}/status", crd.plural)]),
        verbs: vec!["get", "list", "watch", "create", "update", "patch", "delete"]
            .into_iter()
            .map(str::to_string)
            .collect(),
        ..Default::default()
    }]
}

/// Order-insensitive set equality over policy rules. Duplicate or reordered
/// rules (and reordered verb/resource lists) compare equal.
pub fn policy_rules_equal(a: &[PolicyRule], b: &[PolicyRule]) -> bool {
    fn keys(rules: &[PolicyRule]) -> Vec<String> {
        let mut out: Vec<String> = rules
            .iter()
            .map(|r| {
                let mut r = r.clone();
                if let Some(v) = r.api_groups.as_mut() {
                    v.sort();
                }
                if let Some(v) = r.non_resource_urls.as_mut() {
                    v.sort();
                }
                if let Some(v) = r.resource_names.as_mut() {
                    v.sort();
                }
                if let Some(v) = r.resources.as_mut() {
                    v.sort();
                }
                r.verbs.sort();
                serde_json::to_string(&r).unwrap_or_default()
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }
    keys(a) == keys(b)
}

/// Create or converge the namespaced manager Role to the desired rule set.
pub async fn ensure_role(
    client: &Client,
    namespace: &str,
    name: &str,
    desired: Vec<PolicyRule>,
) -> Result<()> {
    let api: Api<Role> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(name).await? {
        None => {
            let role: Role = serde_json::from_value(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "Role",
                "metadata": { "name": name, "namespace": namespace },
            }))?;
            let role = Role { rules: Some(desired), ..role };
            api.create(&PostParams::default(), &role).await?;
            info!(role = name, namespace, "created manager role");
            Ok(())
        }
        Some(existing) => {
            let current = existing.rules.clone().unwrap_or_default();
            if policy_rules_equal(&current, &desired) {
                return Ok(());
            }
            warn!(role = name, namespace, "manager role drifted; converging");
            let updated = Role { rules: Some(desired), ..existing };
            api.replace(name, &PostParams::default(), &updated).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::config::ResourceScope;

    fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
            resources: Some(resources.iter().map(|s| s.to_string()).collect()),
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn equal_rules_in_any_order_compare_equal() {
        let a = vec![
            rule(&["example.io"], &["widgets"], &["get", "list"]),
            rule(&[""], &["pods"], &["watch"]),
        ];
        let b = vec![
            rule(&[""], &["pods"], &["watch"]),
            rule(&["example.io"], &["widgets"], &["list", "get"]),
        ];
        assert!(policy_rules_equal(&a, &b));
    }

    #[test]
    fn duplicates_do_not_break_equality() {
        let a = vec![
            rule(&[""], &["pods"], &["get"]),
            rule(&[""], &["pods"], &["get"]),
        ];
        let b = vec![rule(&[""], &["pods"], &["get"])];
        assert!(policy_rules_equal(&a, &b));
    }

    #[test]
    fn differing_verbs_compare_unequal() {
        let a = vec![rule(&[""], &["pods"], &["get"])];
        let b = vec![rule(&[""], &["pods"], &["get", "delete"])];
        assert!(!policy_rules_equal(&a, &b));
    }

    #[test]
    fn subset_is_not_equality() {
        let a = vec![
            rule(&[""], &["pods"], &["get"]),
            rule(&[""], &["secrets"], &["get"]),
        ];
        let b = vec![rule(&[""], &["pods"], &["get"])];
        assert!(!policy_rules_equal(&a, &b));
    }

    #[test]
    fn manager_rules_cover_status_subresource() {
        let crd = CrdDescriptor {
            group: "example.io".into(),
            version: "v1".into(),
            kind: "Widget".into(),
            plural: "widgets".into(),
            scope: ResourceScope::Namespaced,
        };
        let rules = manager_rules(&crd);
        let resources = rules[0].resources.clone().unwrap();
        assert!(resources.contains(&"widgets/status".to_string()));
        assert!(rules[0].verbs.contains(&"watch".to_string()));
    }
}
