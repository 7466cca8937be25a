//! Gateway and gateway rule tasks
//!
//! Rules nodes own no remote object of their own: their operations run against
//! the gateway on the other end of the relationship, and the rules they create
//! are kept in the rules node's bag so that delete can find them again.

use serde_json::{Map, Value};
use tracing::{debug, warn};
use vcloud_common::{DynamicValue, Element, ProviderError, Result, RuleFamily};

use super::{TaskCall, TaskOutcome};
use crate::resources::{value_text, Gateway, Resource};

pub async fn configure_gateway(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let gateway = Gateway::from_descriptor(call.primary());
    gateway.lookup().await?;
    if call.external {
        return Ok(TaskOutcome::adopted(gateway));
    }
    Ok(TaskOutcome::done(gateway))
}

/// Gateways belong to the VDC; deleting the node leaves the gateway alone.
pub async fn delete_gateway(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    Ok(TaskOutcome::done(Gateway::from_descriptor(call.primary())))
}

/// Definitions from the rules node configuration, keyed by their label.
fn definitions(family: RuleFamily, config: &Map<String, Value>) -> Vec<(String, Map<String, Value>)> {
    config
        .iter()
        .filter_map(|(label, definition)| {
            let mut definition = definition.as_object()?.clone();
            if family == RuleFamily::Firewall {
                definition
                    .entry("name")
                    .or_insert_with(|| Value::String(label.clone()));
            }
            Some((label.clone(), definition))
        })
        .collect()
}

/// Key a created rule is recorded under
fn rule_key(family: RuleFamily, label: &str, rule: &Element) -> String {
    let field = match family {
        RuleFamily::Firewall => "name",
        RuleFamily::Nat | RuleFamily::DhcpPool => "id",
        RuleFamily::StaticRoute => "network",
    };
    rule.child_text(field)
        .or_else(|| rule.attr(field).map(str::to_string))
        .unwrap_or_else(|| label.to_string())
}

/// Id of a recorded rule, whichever way the provider exposed it
fn recorded_id(rule: &Value) -> Option<String> {
    rule.get("id").map(value_text)
}

pub async fn create_rules(call: &TaskCall<'_>, family: RuleFamily) -> Result<TaskOutcome> {
    let mut gateway = Gateway::from_descriptor(call.secondary()?);
    let mut created = Map::new();
    for (label, definition) in definitions(family, &call.primary().resource_config) {
        let rule = gateway.add_rule(family, &definition).await?;
        debug!("Added {} {} to {}", family, label, gateway.name());
        created.insert(
            rule_key(family, &label, &rule),
            DynamicValue::from(rule).to_plain(),
        );
    }
    call.stage(family.runtime_key(), Value::Object(created));
    Ok(TaskOutcome::done(gateway))
}

pub async fn delete_rules(call: &TaskCall<'_>, family: RuleFamily) -> Result<TaskOutcome> {
    let mut gateway = Gateway::from_descriptor(call.secondary()?);
    let recorded = call
        .bag()
        .get(family.runtime_key())
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (key, rule) in &recorded {
        let Some(rule_id) = recorded_id(rule) else {
            warn!("The {} {} has no recorded id, skipping", family, key);
            continue;
        };
        match gateway.delete_rule(family, &rule_id).await {
            Ok(()) => {}
            // Already gone
            Err(ProviderError::EntityNotFound(_)) | Err(ProviderError::NotFound(_)) => {
                debug!("The {} {} is already gone", family, key);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(TaskOutcome::done(gateway))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_firewall_definitions_are_named_by_label() {
        let config = json!({
            "allow_ssh": {"action": "accept", "destination_values": ["22"]},
            "named": {"name": "explicit", "action": "deny"},
            "garbage": 3
        });
        let defs = definitions(RuleFamily::Firewall, config.as_object().unwrap());
        assert_eq!(defs.len(), 2);
        let by_label: std::collections::HashMap<_, _> = defs.into_iter().collect();
        assert_eq!(by_label["allow_ssh"]["name"], json!("allow_ssh"));
        assert_eq!(by_label["named"]["name"], json!("explicit"));
    }

    #[test]
    fn test_rule_keys() {
        let nat = Element::new("natRule").with_child(Element::string("id", "196609"));
        assert_eq!(rule_key(RuleFamily::Nat, "dnat", &nat), "196609");

        let route = Element::new("staticRoute").with_child(Element::string("network", "10.2.0.0/24"));
        assert_eq!(rule_key(RuleFamily::StaticRoute, "r1", &route), "10.2.0.0/24");

        let bare = Element::new("ipPool");
        assert_eq!(rule_key(RuleFamily::DhcpPool, "pool1", &bare), "pool1");
    }

    #[test]
    fn test_recorded_id() {
        assert_eq!(recorded_id(&json!({"id": 131074})).as_deref(), Some("131074"));
        assert_eq!(recorded_id(&json!({"id": "abc"})).as_deref(), Some("abc"));
        assert_eq!(recorded_id(&json!({"name": "x"})), None);
    }
}
