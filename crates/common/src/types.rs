//! Core types for the vCloud plugin

use serde::{Deserialize, Serialize};

/// Prefix shared by every node type label this plugin manages.
pub const NODE_TYPE_PREFIX: &str = "cloudify.nodes.vcloud.";

/// Resource kinds a node template can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Gateway,
    NatRules,
    FirewallRules,
    DhcpPools,
    StaticRoutes,
    DirectlyConnectedNetwork,
    IsolatedNetwork,
    RoutedNetwork,
    VApp,
    Vm,
    Nic,
    Disk,
    Media,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 13] = [
        ResourceKind::Gateway,
        ResourceKind::NatRules,
        ResourceKind::FirewallRules,
        ResourceKind::DhcpPools,
        ResourceKind::StaticRoutes,
        ResourceKind::DirectlyConnectedNetwork,
        ResourceKind::IsolatedNetwork,
        ResourceKind::RoutedNetwork,
        ResourceKind::VApp,
        ResourceKind::Vm,
        ResourceKind::Nic,
        ResourceKind::Disk,
        ResourceKind::Media,
    ];

    /// The node type label that declares this kind.
    pub fn type_label(&self) -> &'static str {
        match self {
            ResourceKind::Gateway => "cloudify.nodes.vcloud.Gateway",
            ResourceKind::NatRules => "cloudify.nodes.vcloud.NatRules",
            ResourceKind::FirewallRules => "cloudify.nodes.vcloud.FirewallRules",
            ResourceKind::DhcpPools => "cloudify.nodes.vcloud.DHCPPools",
            ResourceKind::StaticRoutes => "cloudify.nodes.vcloud.StaticRoutes",
            ResourceKind::DirectlyConnectedNetwork => {
                "cloudify.nodes.vcloud.DirectlyConnectedVDCNetwork"
            }
            ResourceKind::IsolatedNetwork => "cloudify.nodes.vcloud.IsolatedVDCNetwork",
            ResourceKind::RoutedNetwork => "cloudify.nodes.vcloud.RoutedVDCNetwork",
            ResourceKind::VApp => "cloudify.nodes.vcloud.VApp",
            ResourceKind::Vm => "cloudify.nodes.vcloud.VM",
            ResourceKind::Nic => "cloudify.nodes.vcloud.NIC",
            ResourceKind::Disk => "cloudify.nodes.vcloud.Disk",
            ResourceKind::Media => "cloudify.nodes.vcloud.Media",
        }
    }

    /// Parse an exact type label.
    pub fn from_type_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_label() == label)
    }

    /// Scan a type hierarchy and return the first entry with a known kind.
    ///
    /// The orchestrator lists the hierarchy most specific first, so the first
    /// match is the most specific one.
    pub fn from_type_hierarchy<S: AsRef<str>>(hierarchy: &[S]) -> Option<Self> {
        hierarchy
            .iter()
            .find_map(|label| Self::from_type_label(label.as_ref()))
    }

    /// Primary and secondary adapters for this kind.
    pub fn adapters(&self) -> (AdapterKind, AdapterKind) {
        match self {
            ResourceKind::Gateway => (AdapterKind::Gateway, AdapterKind::Placeholder),
            ResourceKind::NatRules
            | ResourceKind::FirewallRules
            | ResourceKind::DhcpPools
            | ResourceKind::StaticRoutes => (AdapterKind::Placeholder, AdapterKind::Gateway),
            ResourceKind::DirectlyConnectedNetwork => (
                AdapterKind::Network(NetworkType::DirectlyConnected),
                AdapterKind::Placeholder,
            ),
            ResourceKind::IsolatedNetwork => (
                AdapterKind::Network(NetworkType::Isolated),
                AdapterKind::Placeholder,
            ),
            ResourceKind::RoutedNetwork => (
                AdapterKind::Network(NetworkType::Routed),
                AdapterKind::Placeholder,
            ),
            ResourceKind::VApp => (AdapterKind::VApp, AdapterKind::Placeholder),
            ResourceKind::Vm => (AdapterKind::Vm, AdapterKind::VApp),
            ResourceKind::Nic => (AdapterKind::Nic, AdapterKind::Vm),
            ResourceKind::Disk => (AdapterKind::Disk, AdapterKind::Vm),
            ResourceKind::Media => (AdapterKind::Media, AdapterKind::Vm),
        }
    }

    /// Network flavour, for the three network kinds.
    pub fn network_type(&self) -> Option<NetworkType> {
        match self.adapters().0 {
            AdapterKind::Network(network_type) => Some(network_type),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = self.type_label();
        write!(f, "{}", label.strip_prefix(NODE_TYPE_PREFIX).unwrap_or(label))
    }
}

/// Which resource adapter implements a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Gateway,
    Network(NetworkType),
    VApp,
    Vm,
    Nic,
    Disk,
    Media,
    /// No-op second slot for kinds that need a single adapter, or the
    /// rules-node side of a gateway rules relationship.
    Placeholder,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Gateway => write!(f, "gateway"),
            AdapterKind::Network(network_type) => write!(f, "network ({})", network_type),
            AdapterKind::VApp => write!(f, "vapp"),
            AdapterKind::Vm => write!(f, "vm"),
            AdapterKind::Nic => write!(f, "nic"),
            AdapterKind::Disk => write!(f, "disk"),
            AdapterKind::Media => write!(f, "media"),
            AdapterKind::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// Org VDC network flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Routed,
    Isolated,
    DirectlyConnected,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Routed => "routed_vdc_network",
            NetworkType::Isolated => "isolated_vdc_network",
            NetworkType::DirectlyConnected => "directly_connected_vdc_network",
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gateway rule families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFamily {
    Firewall,
    Nat,
    DhcpPool,
    StaticRoute,
}

impl RuleFamily {
    /// Runtime property the created rules are recorded under.
    pub fn runtime_key(&self) -> &'static str {
        match self {
            RuleFamily::Firewall | RuleFamily::Nat => "rules",
            RuleFamily::DhcpPool => "pools",
            RuleFamily::StaticRoute => "routes",
        }
    }
}

impl std::fmt::Display for RuleFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleFamily::Firewall => write!(f, "firewall rule"),
            RuleFamily::Nat => write!(f, "nat rule"),
            RuleFamily::DhcpPool => write!(f, "dhcp pool"),
            RuleFamily::StaticRoute => write!(f, "static route"),
        }
    }
}

/// Terminal and non-terminal statuses of a remote task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    PreRunning,
    Running,
    Success,
    Error,
    Aborted,
    Canceled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Aborted | TaskStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::PreRunning => "preRunning",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "preRunning" => Some(TaskStatus::PreRunning),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "error" => Some(TaskStatus::Error),
            "aborted" => Some(TaskStatus::Aborted),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Power transitions for vApps and VMs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    Shutdown,
    Deploy,
    Undeploy,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::PowerOn => write!(f, "power on"),
            PowerAction::PowerOff => write!(f, "power off"),
            PowerAction::Shutdown => write!(f, "shutdown"),
            PowerAction::Deploy => write!(f, "deploy"),
            PowerAction::Undeploy => write!(f, "undeploy"),
        }
    }
}

/// Power state as the provider reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOff,
    PoweredOn,
    Suspended,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::PoweredOff
    }
}

impl PowerState {
    /// Numeric code used in provider payloads.
    pub fn code(&self) -> i64 {
        match self {
            PowerState::PoweredOff => 8,
            PowerState::PoweredOn => 4,
            PowerState::Suspended => 3,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::PoweredOff => write!(f, "powered off"),
            PowerState::PoweredOn => write!(f, "powered on"),
            PowerState::Suspended => write!(f, "suspended"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_specific_label_wins() {
        let hierarchy = vec![
            "my.custom.Network".to_string(),
            "cloudify.nodes.vcloud.RoutedVDCNetwork".to_string(),
            "cloudify.nodes.Network".to_string(),
            "cloudify.nodes.Root".to_string(),
        ];
        assert_eq!(
            ResourceKind::from_type_hierarchy(&hierarchy),
            Some(ResourceKind::RoutedNetwork)
        );
        assert_eq!(
            ResourceKind::RoutedNetwork.network_type(),
            Some(NetworkType::Routed)
        );
    }

    #[test]
    fn test_unknown_hierarchy() {
        let hierarchy = ["cloudify.nodes.Root", "cloudify.nodes.Compute"];
        assert_eq!(ResourceKind::from_type_hierarchy(&hierarchy), None);
    }

    #[test]
    fn test_two_adapter_kinds() {
        assert_eq!(
            ResourceKind::Disk.adapters(),
            (AdapterKind::Disk, AdapterKind::Vm)
        );
        assert_eq!(
            ResourceKind::Vm.adapters(),
            (AdapterKind::Vm, AdapterKind::VApp)
        );
        assert_eq!(
            ResourceKind::Gateway.adapters().1,
            AdapterKind::Placeholder
        );
    }

    #[test]
    fn test_labels_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_type_label(kind.type_label()), Some(kind));
        }
        assert_eq!(ResourceKind::DhcpPools.to_string(), "DHCPPools");
    }

    #[test]
    fn test_task_status_parse() {
        assert_eq!(TaskStatus::parse("success"), Some(TaskStatus::Success));
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert_eq!(TaskStatus::parse("bogus"), None);
    }
}
