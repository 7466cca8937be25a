//! Edge gateway adapter and its rule families

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::value::make_map;
use vcloud_common::{DynamicValue, Element, ProviderError, RuleFamily};

use super::{value_text, Resource};
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

pub struct Gateway {
    name: String,
    vdc: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    tasks: TaskHistory,
}

impl Gateway {
    pub fn new(name: impl Into<String>, client: Arc<dyn VcdClient>, vdc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vdc: vdc.into(),
            client,
            config: Map::new(),
            tasks: TaskHistory::default(),
        }
    }

    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        Self {
            config: descriptor.resource_config.clone(),
            tasks: descriptor.tasks.clone(),
            ..Self::new(
                descriptor.resource_id.clone(),
                descriptor.client.clone(),
                descriptor.vdc.clone(),
            )
        }
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub async fn lookup(&self) -> ProviderResult<Element> {
        self.client.get_gateway(&self.vdc, &self.name).await
    }

    pub async fn rules(&self, family: RuleFamily) -> ProviderResult<Vec<Element>> {
        self.client
            .list_gateway_rules(&self.vdc, &self.name, family)
            .await
    }

    /// Existing rule equivalent to `definition`.
    pub async fn find_rule(
        &self,
        family: RuleFamily,
        definition: &Map<String, Value>,
    ) -> ProviderResult<Option<Element>> {
        Ok(self
            .rules(family)
            .await?
            .into_iter()
            .find(|rule| rule_matches(family, rule, definition)))
    }

    /// Add a rule. The provider rejects a rule it already has with a bad
    /// request, in which case the existing rule is returned.
    pub async fn add_rule(
        &mut self,
        family: RuleFamily,
        definition: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        match self
            .client
            .add_gateway_rule(&self.vdc, &self.name, family, definition)
            .await
        {
            Ok(rule) => Ok(rule),
            Err(err @ ProviderError::BadRequest { .. }) => {
                match self.find_rule(family, definition).await? {
                    Some(rule) => {
                        debug!("The {} already exists on {}: {}", family, self.name, err);
                        Ok(rule)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete_rule(&mut self, family: RuleFamily, rule_id: &str) -> ProviderResult<()> {
        debug!("Deleting {} {} from {}", family, rule_id, self.name);
        self.client
            .delete_gateway_rule(&self.vdc, &self.name, family, rule_id)
            .await
    }
}

/// Fields identifying a rule of each family.
fn identity_keys(family: RuleFamily, definition: &Map<String, Value>) -> Vec<&str> {
    match family {
        RuleFamily::Firewall => vec!["name"],
        RuleFamily::DhcpPool => vec!["ip_range"],
        RuleFamily::StaticRoute => vec!["network"],
        RuleFamily::Nat => definition
            .keys()
            .map(String::as_str)
            .filter(|k| *k != "id")
            .collect(),
    }
}

fn rule_matches(family: RuleFamily, rule: &Element, definition: &Map<String, Value>) -> bool {
    let keys = identity_keys(family, definition);
    !keys.is_empty()
        && keys.iter().all(|key| match (rule.child_text(key), definition.get(*key)) {
            (Some(actual), Some(expected)) => actual == value_text(expected),
            _ => false,
        })
}

#[async_trait]
impl Resource for Gateway {
    fn type_name(&self) -> &'static str {
        "gateway"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn client(&self) -> &Arc<dyn VcdClient> {
        &self.client
    }

    fn tasks(&self) -> &TaskHistory {
        &self.tasks
    }

    async fn exposed_data(&self) -> ProviderResult<DynamicValue> {
        let gateway = self.lookup().await?;
        Ok(make_map(vec![
            ("gateway_address", gateway.child_text("gatewayAddress").into()),
            ("dhcp_pools", self.rules(RuleFamily::DhcpPool).await?.into()),
            ("nat_rules", self.rules(RuleFamily::Nat).await?.into()),
            ("static_routes", self.rules(RuleFamily::StaticRoute).await?.into()),
            ("firewall_rules", self.rules(RuleFamily::Firewall).await?.into()),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(pairs: &[(&str, &str)]) -> Element {
        pairs.iter().fold(
            Element::new("rule").with_attr("id", "r1"),
            |rule, (k, v)| rule.with_child(Element::string(*k, *v)),
        )
    }

    fn definition(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_firewall_rules_match_by_name() {
        let existing = rule(&[("name", "allow-ssh"), ("action", "accept")]);
        assert!(rule_matches(
            RuleFamily::Firewall,
            &existing,
            &definition(json!({"name": "allow-ssh", "action": "deny"}))
        ));
        assert!(!rule_matches(
            RuleFamily::Firewall,
            &existing,
            &definition(json!({"name": "allow-http"}))
        ));
    }

    #[test]
    fn test_nat_rules_match_on_every_field() {
        let existing = rule(&[
            ("action", "snat"),
            ("original_address", "10.0.0.0/24"),
            ("translated_address", "192.168.1.1"),
        ]);
        assert!(rule_matches(
            RuleFamily::Nat,
            &existing,
            &definition(json!({"action": "snat", "original_address": "10.0.0.0/24"}))
        ));
        assert!(!rule_matches(
            RuleFamily::Nat,
            &existing,
            &definition(json!({"action": "dnat", "original_address": "10.0.0.0/24"}))
        ));
        assert!(!rule_matches(RuleFamily::Nat, &existing, &Map::new()));
    }
}
