//! In-memory cloud directory
//!
//! A deterministic stand-in for one organization and its VDCs, implementing
//! [`VcdClient`]. Calls take effect immediately; the task each mutating call
//! returns settles according to its script (success unless told otherwise).
//! Failures can be injected per call name, and the whole state can be
//! snapshotted to JSON so that separate processes can share one cloud.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use vcloud_common::{
    Element, Error, NetworkType, PowerAction, PowerState, ProviderError, Result, RuleFamily,
    TaskStatus,
};

use crate::client::{ProviderResult, TaskHandle, VcdClient};

const API_ROOT: &str = "https://vcd.local/api";

/// How a task settles once waited on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScript {
    Succeed,
    /// Still running at every wait until [`InMemoryCloud::complete_tasks`]
    Running,
    /// Ends in error with this message
    Fail(String),
}

impl Default for TaskScript {
    fn default() -> Self {
        TaskScript::Succeed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub operation: String,
    pub owner_id: String,
    pub owner_href: String,
    pub status: TaskStatus,
    pub started: DateTime<Utc>,
    pub script: TaskScript,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub network_type: NetworkType,
    pub config: Map<String, Value>,
    /// First three octets of the addresses handed out on this network
    pub prefix: String,
    pub next_host: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: String,
    pub definition: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub id: String,
    pub address: String,
    pub firewall_rules: Vec<RuleRecord>,
    pub nat_rules: Vec<RuleRecord>,
    pub dhcp_pools: Vec<RuleRecord>,
    pub static_routes: Vec<RuleRecord>,
}

impl GatewayRecord {
    fn rules(&self, family: RuleFamily) -> &Vec<RuleRecord> {
        match family {
            RuleFamily::Firewall => &self.firewall_rules,
            RuleFamily::Nat => &self.nat_rules,
            RuleFamily::DhcpPool => &self.dhcp_pools,
            RuleFamily::StaticRoute => &self.static_routes,
        }
    }

    fn rules_mut(&mut self, family: RuleFamily) -> &mut Vec<RuleRecord> {
        match family {
            RuleFamily::Firewall => &mut self.firewall_rules,
            RuleFamily::Nat => &mut self.nat_rules,
            RuleFamily::DhcpPool => &mut self.dhcp_pools,
            RuleFamily::StaticRoute => &mut self.static_routes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicRecord {
    pub index: i64,
    pub network: Option<String>,
    pub ip_address: Option<String>,
    pub ip_address_mode: String,
    pub is_primary: bool,
    pub is_connected: bool,
    pub adapter_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub config: Map<String, Value>,
    pub power: PowerState,
    pub nics: Vec<NicRecord>,
    pub disks: Vec<String>,
    pub media: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VAppRecord {
    pub id: String,
    pub config: Map<String, Value>,
    pub networks: Vec<String>,
    pub vms: BTreeMap<String, VmRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: String,
    pub name: String,
    pub config: Map<String, Value>,
    pub attached_to: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VdcRecord {
    pub networks: BTreeMap<String, NetworkRecord>,
    pub gateways: BTreeMap<String, GatewayRecord>,
    pub vapps: BTreeMap<String, VAppRecord>,
    pub disks: Vec<DiskRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub file_name: String,
    pub bytes: u64,
}

/// Everything the simulated organization holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudState {
    pub vdcs: BTreeMap<String, VdcRecord>,
    pub catalogs: BTreeMap<String, BTreeMap<String, MediaRecord>>,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub next_rule_id: u64,
    pub next_subnet: u8,
}

/// Simulated cloud directory
#[derive(Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    scripts: Mutex<VecDeque<TaskScript>>,
    calls: Mutex<HashMap<String, usize>>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn href(kind: &str, id: &str) -> String {
    format!("{}/{}/{}", API_ROOT, kind, id)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn duplicate(kind: &str, name: &str) -> ProviderError {
    ProviderError::bad_request(
        "DUPLICATE_NAME",
        format!("The VCD entity {} {} already exists.", kind, name),
    )
}

fn missing(kind: &str, name: &str) -> ProviderError {
    ProviderError::EntityNotFound(format!("{} '{}' not found", kind, name))
}

fn valid_computer_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.chars().all(|c| c.is_ascii_digit())
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vdc(mut self, vdc: &str) -> Self {
        self.state
            .get_mut()
            .vdcs
            .entry(vdc.to_string())
            .or_default();
        self
    }

    pub fn with_gateway(mut self, vdc: &str, name: &str, address: &str) -> Self {
        let record = self.state.get_mut().vdcs.entry(vdc.to_string()).or_default();
        record.gateways.insert(
            name.to_string(),
            GatewayRecord {
                id: new_id(),
                address: address.to_string(),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_catalog(mut self, catalog: &str) -> Self {
        self.state
            .get_mut()
            .catalogs
            .entry(catalog.to_string())
            .or_default();
        self
    }

    /// Make the next call named `call` fail with `err`.
    pub fn fail_next(&self, call: &str, err: ProviderError) {
        self.failures
            .lock()
            .entry(call.to_string())
            .or_default()
            .push_back(err);
    }

    /// Script the outcome of the next task any call creates.
    pub fn script_next_task(&self, script: TaskScript) {
        self.scripts.lock().push_back(script);
    }

    /// Let every running task finish successfully.
    pub fn complete_tasks(&self) {
        for task in self.state.lock().tasks.values_mut() {
            if task.script == TaskScript::Running {
                task.script = TaskScript::Succeed;
            }
        }
    }

    /// Number of times `call` was invoked
    pub fn calls(&self, call: &str) -> usize {
        self.calls.lock().get(call).copied().unwrap_or(0)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> CloudState {
        self.state.lock().clone()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.state.lock())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let state: CloudState = serde_json::from_str(json)?;
        Ok(Self {
            state: Mutex::new(state),
            ..Default::default()
        })
    }

    pub fn from_state(state: CloudState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Default::default()
        }
    }

    /// Count the call and surface an injected failure, if any.
    fn enter(&self, call: &str) -> ProviderResult<()> {
        *self.calls.lock().entry(call.to_string()).or_default() += 1;
        debug!("simulated call {}", call);
        match self.failures.lock().get_mut(call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start_task(
        &self,
        state: &mut CloudState,
        operation: &str,
        owner_id: &str,
        owner_href: &str,
    ) -> Element {
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let id = new_id();
        let started = Utc::now();
        let element = Element::new("Task")
            .with_attr("id", format!("urn:vcloud:task:{}", id))
            .with_attr("href", href("task", &id))
            .with_attr("operationName", operation)
            .with_attr("status", TaskStatus::Running.as_str())
            .with_attr("owner_id", owner_id)
            .with_attr("owner_href", owner_href)
            .with_attr("startTime", started.to_rfc3339());
        state.tasks.insert(
            format!("urn:vcloud:task:{}", id),
            TaskRecord {
                id: id.clone(),
                operation: operation.to_string(),
                owner_id: owner_id.to_string(),
                owner_href: owner_href.to_string(),
                status: TaskStatus::Running,
                started,
                script,
            },
        );
        element
    }
}

fn vdc_mut<'a>(state: &'a mut CloudState, vdc: &str) -> ProviderResult<&'a mut VdcRecord> {
    state.vdcs.get_mut(vdc).ok_or_else(|| missing("VDC", vdc))
}

fn vapp_mut<'a>(vdc: &'a mut VdcRecord, name: &str) -> ProviderResult<&'a mut VAppRecord> {
    vdc.vapps.get_mut(name).ok_or_else(|| missing("vApp", name))
}

fn vm_mut<'a>(vapp: &'a mut VAppRecord, name: &str) -> ProviderResult<&'a mut VmRecord> {
    vapp.vms.get_mut(name).ok_or_else(|| missing("VM", name))
}

fn network_element(name: &str, record: &NetworkRecord) -> Element {
    let mut element = Element::new("OrgVdcNetwork")
        .with_attr("name", name)
        .with_attr("id", record.id.as_str())
        .with_attr("href", href("network", &record.id))
        .with_attr("type", record.network_type.as_str());
    for (key, value) in &record.config {
        element = element.with_child(Element::string(key.as_str(), text(value)));
    }
    element
}

fn rule_tag(family: RuleFamily) -> &'static str {
    match family {
        RuleFamily::Firewall => "firewallRule",
        RuleFamily::Nat => "natRule",
        RuleFamily::DhcpPool => "ipPool",
        RuleFamily::StaticRoute => "staticRoute",
    }
}

fn rule_element(family: RuleFamily, rule: &RuleRecord) -> Element {
    let mut element = Element::new(rule_tag(family)).with_child(Element::string("id", rule.id.as_str()));
    for (key, value) in &rule.definition {
        if key != "id" {
            element = element.with_child(Element::string(key.as_str(), text(value)));
        }
    }
    element
}

fn nic_element(nic: &NicRecord) -> Element {
    let mut element = Element::new("NetworkConnection")
        .with_child(Element::int("index", nic.index))
        .with_child(Element::string("ip_address_mode", nic.ip_address_mode.as_str()))
        .with_child(Element::boolean("is_primary", nic.is_primary))
        .with_child(Element::boolean("is_connected", nic.is_connected))
        .with_child(Element::string("adapter_type", nic.adapter_type.as_str()));
    if let Some(network) = &nic.network {
        element = element.with_child(Element::string("network", network.as_str()));
    }
    if let Some(address) = &nic.ip_address {
        element = element.with_child(Element::string("ip_address", address.as_str()));
    }
    element
}

fn vm_element(name: &str, vapp: &str, vm: &VmRecord) -> Element {
    Element::new("Vm")
        .with_attr("name", name)
        .with_attr("id", vm.id.as_str())
        .with_attr("href", href("vApp/vm", &vm.id))
        .with_child(Element::string("status", vm.power.to_string()))
        .with_child(Element::string("vapp", vapp))
}

fn vapp_element(name: &str, vapp: &VAppRecord) -> Element {
    let powered_on = vapp.vms.values().any(|vm| vm.power == PowerState::PoweredOn);
    let status = if powered_on {
        PowerState::PoweredOn
    } else {
        PowerState::PoweredOff
    };
    let mut element = Element::new("VApp")
        .with_attr("name", name)
        .with_attr("id", vapp.id.as_str())
        .with_attr("href", href("vApp", &vapp.id))
        .with_attr("status", status.code().to_string())
        .with_child(
            Element::new("LeaseSettingsSection")
                .with_child(Element::int("DeploymentLeaseInSeconds", 0))
                .with_child(Element::int("StorageLeaseInSeconds", 0)),
        );
    for network in &vapp.networks {
        element = element.with_child(Element::new("NetworkConfig").with_attr("networkName", network.as_str()));
    }
    for (vm_name, vm) in &vapp.vms {
        element = element.with_child(
            Element::new("Vm")
                .with_attr("name", vm_name.as_str())
                .with_attr("href", href("vApp/vm", &vm.id)),
        );
    }
    element
}

fn disk_element(disk: &DiskRecord) -> Element {
    let int = |key: &str, default: i64| disk.config.get(key).and_then(Value::as_i64).unwrap_or(default);
    let string = |key: &str, default: &str| {
        disk.config
            .get(key)
            .map(text)
            .unwrap_or_else(|| default.to_string())
    };
    Element::new("Disk")
        .with_attr("name", disk.name.as_str())
        .with_attr("id", disk.id.as_str())
        .with_attr("href", href("disk", &disk.id))
        .with_attr("status", "1")
        .with_child(Element::int("size", int("size", 1024)))
        .with_child(Element::int("iops", int("iops", 0)))
        .with_child(Element::string("busType", string("bus_type", "6")))
        .with_child(Element::string("busSubType", string("bus_sub_type", "VirtualSCSI")))
}

fn with_task(entity: Element, task: Element) -> Element {
    entity.with_child(Element::new("Tasks").with_child(task))
}

/// Allocate the next address on `network`, if the VDC has it.
fn allocate_address(state: &mut CloudState, vdc: &str, network: &str) -> ProviderResult<String> {
    let record = vdc_mut(state, vdc)?
        .networks
        .get_mut(network)
        .ok_or_else(|| missing("network", network))?;
    let host = record.next_host;
    record.next_host = record.next_host.saturating_add(1);
    Ok(format!("{}.{}", record.prefix, host))
}

fn nic_from_definition(
    state: &mut CloudState,
    vdc: &str,
    index: i64,
    definition: &Map<String, Value>,
) -> ProviderResult<NicRecord> {
    let network = definition
        .get("network_name")
        .or_else(|| definition.get("network"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let mode = definition
        .get("ip_address_mode")
        .and_then(Value::as_str)
        .unwrap_or("DHCP")
        .to_string();
    let ip_address = match (&network, mode.as_str()) {
        (None, _) | (_, "NONE") => None,
        (Some(_), "MANUAL") => definition
            .get("ip_address")
            .and_then(Value::as_str)
            .map(str::to_string),
        (Some(network), _) => Some(allocate_address(state, vdc, network)?),
    };
    Ok(NicRecord {
        index,
        network,
        ip_address,
        ip_address_mode: mode,
        is_primary: definition
            .get("is_primary")
            .and_then(Value::as_bool)
            .unwrap_or(index == 0),
        is_connected: definition
            .get("is_connected")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        adapter_type: definition
            .get("adapter_type")
            .and_then(Value::as_str)
            .unwrap_or("VMXNET3")
            .to_string(),
    })
}

fn new_vm(
    state: &mut CloudState,
    vdc: &str,
    name: &str,
    config: &Map<String, Value>,
) -> ProviderResult<VmRecord> {
    if !valid_computer_name(name) {
        return Err(ProviderError::bad_request(
            "BAD_REQUEST",
            format!(
                "Computer name can only contain alphanumeric characters and hyphens, \
                 and cannot be all digits: {}",
                name
            ),
        ));
    }
    let mut nics = Vec::new();
    if config.contains_key("network") {
        nics.push(nic_from_definition(state, vdc, 0, config)?);
    }
    Ok(VmRecord {
        id: new_id(),
        config: config.clone(),
        power: PowerState::PoweredOff,
        nics,
        disks: Vec::new(),
        media: None,
    })
}

fn apply_power(power: &mut PowerState, action: PowerAction, name: &str) -> ProviderResult<()> {
    match action {
        PowerAction::PowerOn | PowerAction::Deploy => *power = PowerState::PoweredOn,
        PowerAction::PowerOff | PowerAction::Shutdown | PowerAction::Undeploy => {
            if *power != PowerState::PoweredOn {
                return Err(ProviderError::bad_request(
                    "BAD_REQUEST",
                    format!(
                        "The requested operation could not be executed since VM {} is not powered on.",
                        name
                    ),
                ));
            }
            *power = PowerState::PoweredOff;
        }
    }
    Ok(())
}

fn network_in_use(vdc: &VdcRecord, network: &str) -> bool {
    vdc.vapps.values().any(|vapp| {
        vapp.networks.iter().any(|n| n == network)
            || vapp
                .vms
                .values()
                .any(|vm| vm.nics.iter().any(|nic| nic.network.as_deref() == Some(network)))
    })
}

#[async_trait]
impl VcdClient for InMemoryCloud {
    async fn create_network(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("create_network")?;
        let mut state = self.state.lock();
        let subnet = state.next_subnet;
        state.next_subnet = state.next_subnet.wrapping_add(1);
        let record = vdc_mut(&mut state, vdc)?;
        if record.networks.contains_key(name) {
            return Err(duplicate("network", name));
        }
        if network_type == NetworkType::Routed {
            let gateway = config
                .get("gateway_name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !record.gateways.contains_key(gateway) {
                return Err(missing("gateway", gateway));
            }
        }
        let prefix = config
            .get("gateway_ip")
            .and_then(Value::as_str)
            .and_then(|ip| ip.rsplit_once('.'))
            .map(|(prefix, _)| prefix.to_string())
            .unwrap_or_else(|| format!("10.0.{}", subnet));
        let network = NetworkRecord {
            id: new_id(),
            network_type,
            config: config.clone(),
            prefix,
            next_host: 10,
        };
        let entity = network_element(name, &network);
        let owner_href = href("network", &network.id);
        let owner_id = network.id.clone();
        record.networks.insert(name.to_string(), network);
        let task = self.start_task(&mut state, "orgVdcNetworkCreate", &owner_id, &owner_href);
        Ok(with_task(entity, task))
    }

    async fn get_network(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
    ) -> ProviderResult<Element> {
        self.enter("get_network")?;
        let mut state = self.state.lock();
        let network = vdc_mut(&mut state, vdc)?
            .networks
            .get(name)
            .filter(|n| n.network_type == network_type)
            .ok_or_else(|| missing("network", name))?;
        Ok(network_element(name, network))
    }

    async fn list_allocated_ips(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
    ) -> ProviderResult<Vec<Element>> {
        self.enter("list_allocated_ips")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        if !record
            .networks
            .get(name)
            .is_some_and(|n| n.network_type == network_type)
        {
            return Err(missing("network", name));
        }
        let mut allocated = Vec::new();
        for vapp in record.vapps.values() {
            for (vm_name, vm) in &vapp.vms {
                for nic in vm.nics.iter().filter(|nic| nic.network.as_deref() == Some(name)) {
                    if let Some(address) = &nic.ip_address {
                        allocated.push(
                            Element::new("IpAddress")
                                .with_child(Element::string("ip_address", address.as_str()))
                                .with_child(Element::string("name", vm_name.as_str())),
                        );
                    }
                }
            }
        }
        Ok(allocated)
    }

    async fn delete_network(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
    ) -> ProviderResult<Element> {
        self.enter("delete_network")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        let network = record
            .networks
            .get(name)
            .filter(|n| n.network_type == network_type)
            .ok_or_else(|| missing("network", name))?;
        if network_in_use(record, name) {
            return Err(ProviderError::bad_request(
                "BUSY_ENTITY",
                format!("Network {} cannot be deleted, because it is in use.", name),
            ));
        }
        let (owner_id, owner_href) = (network.id.clone(), href("network", &network.id));
        record.networks.remove(name);
        Ok(self.start_task(&mut state, "orgVdcNetworkDelete", &owner_id, &owner_href))
    }

    async fn get_gateway(&self, vdc: &str, name: &str) -> ProviderResult<Element> {
        self.enter("get_gateway")?;
        let mut state = self.state.lock();
        let gateway = vdc_mut(&mut state, vdc)?
            .gateways
            .get(name)
            .ok_or_else(|| missing("gateway", name))?;
        Ok(Element::new("EdgeGateway")
            .with_attr("name", name)
            .with_attr("id", gateway.id.as_str())
            .with_attr("href", href("edgeGateway", &gateway.id))
            .with_child(Element::string("gatewayAddress", gateway.address.as_str())))
    }

    async fn list_gateway_rules(
        &self,
        vdc: &str,
        gateway: &str,
        family: RuleFamily,
    ) -> ProviderResult<Vec<Element>> {
        self.enter("list_gateway_rules")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?
            .gateways
            .get(gateway)
            .ok_or_else(|| missing("gateway", gateway))?;
        Ok(record
            .rules(family)
            .iter()
            .map(|rule| rule_element(family, rule))
            .collect())
    }

    async fn add_gateway_rule(
        &self,
        vdc: &str,
        gateway: &str,
        family: RuleFamily,
        definition: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("add_gateway_rule")?;
        let mut state = self.state.lock();
        state.next_rule_id += 1;
        let id = (196608 + state.next_rule_id).to_string();
        let record = vdc_mut(&mut state, vdc)?
            .gateways
            .get_mut(gateway)
            .ok_or_else(|| missing("gateway", gateway))?;
        if record
            .rules(family)
            .iter()
            .any(|rule| &rule.definition == definition)
        {
            return Err(ProviderError::bad_request(
                "BAD_REQUEST",
                format!("The {} already exists on {}.", family, gateway),
            ));
        }
        let rule = RuleRecord {
            id,
            definition: definition.clone(),
        };
        let element = rule_element(family, &rule);
        record.rules_mut(family).push(rule);
        Ok(element)
    }

    async fn delete_gateway_rule(
        &self,
        vdc: &str,
        gateway: &str,
        family: RuleFamily,
        rule_id: &str,
    ) -> ProviderResult<()> {
        self.enter("delete_gateway_rule")?;
        let mut state = self.state.lock();
        let rules = vdc_mut(&mut state, vdc)?
            .gateways
            .get_mut(gateway)
            .ok_or_else(|| missing("gateway", gateway))?
            .rules_mut(family);
        let before = rules.len();
        rules.retain(|rule| rule.id != rule_id);
        if rules.len() == before {
            return Err(missing(&family.to_string(), rule_id));
        }
        Ok(())
    }

    async fn create_vapp(
        &self,
        vdc: &str,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("create_vapp")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        if record.vapps.contains_key(name) {
            return Err(duplicate("vApp", name));
        }
        let networks: Vec<String> = config
            .get("network")
            .and_then(Value::as_str)
            .map(|n| vec![n.to_string()])
            .unwrap_or_default();
        if let Some(network) = networks.iter().find(|n| !record.networks.contains_key(*n)) {
            return Err(missing("network", network));
        }
        let vapp = VAppRecord {
            id: new_id(),
            config: config.clone(),
            networks,
            vms: BTreeMap::new(),
        };
        let entity = vapp_element(name, &vapp);
        let (owner_id, owner_href) = (vapp.id.clone(), href("vApp", &vapp.id));
        record.vapps.insert(name.to_string(), vapp);
        let task = self.start_task(&mut state, "vdcComposeVapp", &owner_id, &owner_href);
        Ok(with_task(entity, task))
    }

    async fn instantiate_vapp(
        &self,
        vdc: &str,
        name: &str,
        vm_name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("instantiate_vapp")?;
        let mut state = self.state.lock();
        if vdc_mut(&mut state, vdc)?.vapps.contains_key(name) {
            return Err(duplicate("vApp", name));
        }
        let vm = new_vm(&mut state, vdc, vm_name, config)?;
        let record = vdc_mut(&mut state, vdc)?;
        let mut vapp = VAppRecord {
            id: new_id(),
            config: config.clone(),
            networks: config
                .get("network")
                .and_then(Value::as_str)
                .map(|n| vec![n.to_string()])
                .unwrap_or_default(),
            vms: BTreeMap::new(),
        };
        vapp.vms.insert(vm_name.to_string(), vm);
        let entity = vapp_element(name, &vapp);
        let (owner_id, owner_href) = (vapp.id.clone(), href("vApp", &vapp.id));
        record.vapps.insert(name.to_string(), vapp);
        let task = self.start_task(&mut state, "vdcInstantiateVapp", &owner_id, &owner_href);
        Ok(with_task(entity, task))
    }

    async fn get_vapp(&self, vdc: &str, name: &str) -> ProviderResult<Element> {
        self.enter("get_vapp")?;
        let mut state = self.state.lock();
        let vapp = vapp_mut(vdc_mut(&mut state, vdc)?, name)?;
        Ok(vapp_element(name, vapp))
    }

    async fn delete_vapp(&self, vdc: &str, name: &str) -> ProviderResult<Element> {
        self.enter("delete_vapp")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        let vapp = record.vapps.remove(name).ok_or_else(|| missing("vApp", name))?;
        let released: Vec<String> = vapp.vms.values().flat_map(|vm| vm.disks.clone()).collect();
        for disk in record.disks.iter_mut() {
            if released.contains(&href("disk", &disk.id)) {
                disk.attached_to = None;
            }
        }
        Ok(self.start_task(&mut state, "vdcDeleteVapp", &vapp.id, &href("vApp", &vapp.id)))
    }

    async fn power_vapp(
        &self,
        vdc: &str,
        name: &str,
        action: PowerAction,
    ) -> ProviderResult<Element> {
        self.enter("power_vapp")?;
        let mut state = self.state.lock();
        let vapp = vapp_mut(vdc_mut(&mut state, vdc)?, name)?;
        let powering_off = !matches!(action, PowerAction::PowerOn | PowerAction::Deploy);
        if powering_off && !vapp.vms.values().any(|vm| vm.power == PowerState::PoweredOn) {
            return Err(ProviderError::bad_request(
                "BAD_REQUEST",
                format!("vApp {} is not powered on.", name),
            ));
        }
        for (vm_name, vm) in vapp.vms.iter_mut() {
            if powering_off && vm.power != PowerState::PoweredOn {
                continue;
            }
            apply_power(&mut vm.power, action, vm_name)?;
        }
        let (owner_id, owner_href) = (vapp.id.clone(), href("vApp", &vapp.id));
        Ok(self.start_task(&mut state, "vappPower", &owner_id, &owner_href))
    }

    async fn connect_vapp_network(
        &self,
        vdc: &str,
        vapp: &str,
        network: &str,
    ) -> ProviderResult<Element> {
        self.enter("connect_vapp_network")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        if !record.networks.contains_key(network) {
            return Err(missing("network", network));
        }
        let vapp = vapp_mut(record, vapp)?;
        if !vapp.networks.iter().any(|n| n == network) {
            vapp.networks.push(network.to_string());
        }
        let (owner_id, owner_href) = (vapp.id.clone(), href("vApp", &vapp.id));
        Ok(self.start_task(&mut state, "vappUpdateNetwork", &owner_id, &owner_href))
    }

    async fn disconnect_vapp_network(
        &self,
        vdc: &str,
        vapp: &str,
        network: &str,
    ) -> ProviderResult<Element> {
        self.enter("disconnect_vapp_network")?;
        let mut state = self.state.lock();
        let vapp = vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?;
        vapp.networks.retain(|n| n != network);
        let (owner_id, owner_href) = (vapp.id.clone(), href("vApp", &vapp.id));
        Ok(self.start_task(&mut state, "vappUpdateNetwork", &owner_id, &owner_href))
    }

    async fn add_vm(
        &self,
        vdc: &str,
        vapp: &str,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("add_vm")?;
        let mut state = self.state.lock();
        let exists = vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?.vms.contains_key(name);
        if exists {
            return Err(duplicate("VM", name));
        }
        let vm = new_vm(&mut state, vdc, name, config)?;
        let (owner_id, owner_href) = (vm.id.clone(), href("vApp/vm", &vm.id));
        vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?
            .vms
            .insert(name.to_string(), vm);
        Ok(self.start_task(&mut state, "vappRecomposeVms", &owner_id, &owner_href))
    }

    async fn get_vm(&self, vdc: &str, vapp: &str, name: &str) -> ProviderResult<Element> {
        self.enter("get_vm")?;
        let mut state = self.state.lock();
        let vm = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, name)?;
        Ok(vm_element(name, vapp, vm))
    }

    async fn delete_vm(&self, vdc: &str, vapp: &str, name: &str) -> ProviderResult<Element> {
        self.enter("delete_vm")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        let vm = vapp_mut(record, vapp)?
            .vms
            .remove(name)
            .ok_or_else(|| missing("VM", name))?;
        for disk in record.disks.iter_mut() {
            if vm.disks.contains(&href("disk", &disk.id)) {
                disk.attached_to = None;
            }
        }
        Ok(self.start_task(&mut state, "vappDeleteVm", &vm.id, &href("vApp/vm", &vm.id)))
    }

    async fn power_vm(
        &self,
        vdc: &str,
        vapp: &str,
        name: &str,
        action: PowerAction,
    ) -> ProviderResult<Element> {
        self.enter("power_vm")?;
        let mut state = self.state.lock();
        let vm = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, name)?;
        apply_power(&mut vm.power, action, name)?;
        let (owner_id, owner_href) = (vm.id.clone(), href("vApp/vm", &vm.id));
        Ok(self.start_task(&mut state, "vappPowerVm", &owner_id, &owner_href))
    }

    async fn list_nics(&self, vdc: &str, vapp: &str, vm: &str) -> ProviderResult<Vec<Element>> {
        self.enter("list_nics")?;
        let mut state = self.state.lock();
        let vm = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, vm)?;
        Ok(vm.nics.iter().map(nic_element).collect())
    }

    async fn add_nic(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        definition: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("add_nic")?;
        let mut state = self.state.lock();
        let index = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, vm)?
            .nics
            .iter()
            .map(|nic| nic.index + 1)
            .max()
            .unwrap_or(0);
        let nic = nic_from_definition(&mut state, vdc, index, definition)?;
        let record = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, vm)?;
        if nic.is_primary {
            for other in record.nics.iter_mut() {
                other.is_primary = false;
            }
        }
        record.nics.push(nic);
        let (owner_id, owner_href) = (record.id.clone(), href("vApp/vm", &record.id));
        Ok(self.start_task(&mut state, "vappUpdateVm", &owner_id, &owner_href))
    }

    async fn delete_nic(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        index: i64,
    ) -> ProviderResult<Element> {
        self.enter("delete_nic")?;
        let mut state = self.state.lock();
        let record = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, vm)?;
        let before = record.nics.len();
        record.nics.retain(|nic| nic.index != index);
        if record.nics.len() == before {
            return Err(missing("NIC", &index.to_string()));
        }
        let (owner_id, owner_href) = (record.id.clone(), href("vApp/vm", &record.id));
        Ok(self.start_task(&mut state, "vappUpdateVm", &owner_id, &owner_href))
    }

    async fn attach_disk(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        disk_href: &str,
    ) -> ProviderResult<Element> {
        self.enter("attach_disk")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        let disk = record
            .disks
            .iter_mut()
            .find(|d| href("disk", &d.id) == disk_href)
            .ok_or_else(|| missing("disk", disk_href))?;
        disk.attached_to = Some(vm.to_string());
        let target = vm_mut(vapp_mut(record, vapp)?, vm)?;
        if !target.disks.iter().any(|d| d == disk_href) {
            target.disks.push(disk_href.to_string());
        }
        let (owner_id, owner_href) = (target.id.clone(), href("vApp/vm", &target.id));
        Ok(self.start_task(&mut state, "vappAttachDisk", &owner_id, &owner_href))
    }

    async fn detach_disk(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        disk_href: &str,
    ) -> ProviderResult<Element> {
        self.enter("detach_disk")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        if let Some(disk) = record
            .disks
            .iter_mut()
            .find(|d| href("disk", &d.id) == disk_href)
        {
            disk.attached_to = None;
        }
        let target = vm_mut(vapp_mut(record, vapp)?, vm)?;
        target.disks.retain(|d| d != disk_href);
        let (owner_id, owner_href) = (target.id.clone(), href("vApp/vm", &target.id));
        Ok(self.start_task(&mut state, "vappDetachDisk", &owner_id, &owner_href))
    }

    async fn insert_media(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        media_href: &str,
    ) -> ProviderResult<Element> {
        self.enter("insert_media")?;
        let mut state = self.state.lock();
        let known = state
            .catalogs
            .values()
            .flat_map(|items| items.values())
            .any(|media| href("media", &media.id) == media_href);
        if !known {
            return Err(missing("media", media_href));
        }
        let target = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, vm)?;
        target.media = Some(media_href.to_string());
        let (owner_id, owner_href) = (target.id.clone(), href("vApp/vm", &target.id));
        Ok(self.start_task(&mut state, "vappInsertMedia", &owner_id, &owner_href))
    }

    async fn eject_media(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        media_id: &str,
    ) -> ProviderResult<Element> {
        self.enter("eject_media")?;
        let mut state = self.state.lock();
        let target = vm_mut(vapp_mut(vdc_mut(&mut state, vdc)?, vapp)?, vm)?;
        if target.media.as_deref().is_some_and(|m| m.ends_with(media_id)) {
            target.media = None;
        }
        let (owner_id, owner_href) = (target.id.clone(), href("vApp/vm", &target.id));
        Ok(self.start_task(&mut state, "vappEjectMedia", &owner_id, &owner_href))
    }

    async fn create_disk(
        &self,
        vdc: &str,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("create_disk")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        if record.disks.iter().any(|d| d.name == name) {
            return Err(duplicate("disk", name));
        }
        let disk = DiskRecord {
            id: format!("urn:vcloud:disk:{}", new_id()),
            name: name.to_string(),
            config: config.clone(),
            attached_to: None,
        };
        let entity = disk_element(&disk);
        let (owner_id, owner_href) = (disk.id.clone(), href("disk", &disk.id));
        record.disks.push(disk);
        let task = self.start_task(&mut state, "vdcCreateDisk", &owner_id, &owner_href);
        Ok(with_task(entity, task))
    }

    async fn get_disk(&self, vdc: &str, id_or_name: &str) -> ProviderResult<Element> {
        self.enter("get_disk")?;
        let mut state = self.state.lock();
        let disk = vdc_mut(&mut state, vdc)?
            .disks
            .iter()
            .find(|d| d.id == id_or_name || d.name == id_or_name)
            .ok_or_else(|| missing("disk", id_or_name))?;
        Ok(disk_element(disk))
    }

    async fn delete_disk(&self, vdc: &str, id_or_name: &str) -> ProviderResult<Element> {
        self.enter("delete_disk")?;
        let mut state = self.state.lock();
        let record = vdc_mut(&mut state, vdc)?;
        let position = record
            .disks
            .iter()
            .position(|d| d.id == id_or_name || d.name == id_or_name)
            .ok_or_else(|| missing("disk", id_or_name))?;
        if let Some(vm) = &record.disks[position].attached_to {
            return Err(ProviderError::bad_request(
                "BUSY_ENTITY",
                format!(
                    "Disk {} is attached to VM {}; it is busy, cannot proceed with the operation.",
                    id_or_name, vm
                ),
            ));
        }
        let disk = record.disks.remove(position);
        Ok(self.start_task(&mut state, "vdcDeleteDisk", &disk.id, &href("disk", &disk.id)))
    }

    async fn update_disk(
        &self,
        vdc: &str,
        id_or_name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        self.enter("update_disk")?;
        let mut state = self.state.lock();
        let disk = vdc_mut(&mut state, vdc)?
            .disks
            .iter_mut()
            .find(|d| d.id == id_or_name || d.name == id_or_name)
            .ok_or_else(|| missing("disk", id_or_name))?;
        for (key, value) in config {
            disk.config.insert(key.clone(), value.clone());
        }
        let (owner_id, owner_href) = (disk.id.clone(), href("disk", &disk.id));
        Ok(self.start_task(&mut state, "vdcUpdateDisk", &owner_id, &owner_href))
    }

    async fn upload_media(
        &self,
        catalog: &str,
        item_name: &str,
        file_name: &str,
    ) -> ProviderResult<u64> {
        self.enter("upload_media")?;
        let bytes = tokio::fs::metadata(file_name)
            .await
            .map_err(|err| ProviderError::NotFound(format!("{}: {}", file_name, err)))?
            .len();
        let mut state = self.state.lock();
        let items = state
            .catalogs
            .get_mut(catalog)
            .ok_or_else(|| missing("catalog", catalog))?;
        if items.contains_key(item_name) {
            return Err(duplicate("catalog item", item_name));
        }
        items.insert(
            item_name.to_string(),
            MediaRecord {
                id: new_id(),
                file_name: file_name.to_string(),
                bytes,
            },
        );
        Ok(bytes)
    }

    async fn get_catalog_item(&self, catalog: &str, item_name: &str) -> ProviderResult<Element> {
        self.enter("get_catalog_item")?;
        let state = self.state.lock();
        let media = state
            .catalogs
            .get(catalog)
            .ok_or_else(|| missing("catalog", catalog))?
            .get(item_name)
            .ok_or_else(|| missing("catalog item", item_name))?;
        Ok(Element::new("CatalogItem")
            .with_attr("name", item_name)
            .with_attr("id", media.id.as_str())
            .with_attr("href", href("catalogItem", &media.id))
            .with_child(
                Element::new("Entity")
                    .with_attr("name", item_name)
                    .with_attr("href", href("media", &media.id))
                    .with_attr("type", "application/vnd.vmware.vcloud.media+xml"),
            ))
    }

    async fn delete_catalog_item(&self, catalog: &str, item_name: &str) -> ProviderResult<()> {
        self.enter("delete_catalog_item")?;
        let mut state = self.state.lock();
        state
            .catalogs
            .get_mut(catalog)
            .ok_or_else(|| missing("catalog", catalog))?
            .remove(item_name)
            .map(|_| ())
            .ok_or_else(|| missing("catalog item", item_name))
    }

    async fn wait_for_task(
        &self,
        task: &TaskHandle,
        _timeout: Duration,
    ) -> ProviderResult<TaskStatus> {
        self.enter("wait_for_task")?;
        let mut state = self.state.lock();
        let record = state
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| missing("task", &task.id))?;
        match &record.script {
            TaskScript::Succeed => {
                record.status = TaskStatus::Success;
                Ok(TaskStatus::Success)
            }
            TaskScript::Running => Ok(record.status),
            TaskScript::Fail(message) => {
                record.status = TaskStatus::Error;
                Err(ProviderError::TaskFailed(message.clone()))
            }
        }
    }
}

impl std::fmt::Debug for InMemoryCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryCloud")
            .field("vdcs", &state.vdcs.keys().collect::<Vec<_>>())
            .field("catalogs", &state.catalogs.keys().collect::<Vec<_>>())
            .field("tasks", &state.tasks.len())
            .finish()
    }
}

/// Load a snapshot file, or start from `seed` when there is none yet.
pub fn load_or(path: &std::path::Path, seed: impl FnOnce() -> InMemoryCloud) -> Result<InMemoryCloud> {
    if !path.exists() {
        return Ok(seed());
    }
    let json = std::fs::read_to_string(path)?;
    InMemoryCloud::from_json(&json).map_err(|err| match err {
        Error::Serialization(e) => {
            Error::InvalidConfig(format!("{} is not a cloud snapshot: {}", path.display(), e))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_vdc("vdc1")
            .with_gateway("vdc1", "edge1", "203.0.113.1")
            .with_catalog("isos")
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn handle(result: &Element) -> TaskHandle {
        crate::client::extract_task(result).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_network_is_rejected() {
        let cloud = cloud();
        let cfg = config(json!({"gateway_ip": "192.168.5.1"}));
        cloud
            .create_network("vdc1", NetworkType::Isolated, "net1", &cfg)
            .await
            .unwrap();
        let err = cloud
            .create_network("vdc1", NetworkType::Isolated, "net1", &cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DUPLICATE_NAME"));
        assert_eq!(cloud.calls("create_network"), 2);
    }

    #[tokio::test]
    async fn test_missing_entities() {
        let cloud = cloud();
        let err = cloud.get_vapp("vdc1", "nope").await.unwrap_err();
        assert!(matches!(err, ProviderError::EntityNotFound(_)));
        let err = cloud.get_gateway("other", "edge1").await.unwrap_err();
        assert!(matches!(err, ProviderError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn test_task_scripts() {
        let cloud = cloud();
        cloud.script_next_task(TaskScript::Running);
        cloud.script_next_task(TaskScript::Fail("Cannot deploy organization VDC network".into()));

        let first = cloud
            .create_vapp("vdc1", "a", &Map::new())
            .await
            .unwrap();
        let second = cloud
            .create_vapp("vdc1", "b", &Map::new())
            .await
            .unwrap();
        let timeout = Duration::from_secs(1);

        assert_eq!(
            cloud.wait_for_task(&handle(&first), timeout).await.unwrap(),
            TaskStatus::Running
        );
        cloud.complete_tasks();
        assert_eq!(
            cloud.wait_for_task(&handle(&first), timeout).await.unwrap(),
            TaskStatus::Success
        );
        let err = cloud.wait_for_task(&handle(&second), timeout).await.unwrap_err();
        assert!(matches!(err, ProviderError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let cloud = cloud();
        cloud.fail_next("get_gateway", ProviderError::empty_bad_request());
        assert!(cloud.get_gateway("vdc1", "edge1").await.is_err());
        assert!(cloud.get_gateway("vdc1", "edge1").await.is_ok());
    }

    #[tokio::test]
    async fn test_network_in_use_cannot_be_deleted() {
        let cloud = cloud();
        cloud
            .create_network("vdc1", NetworkType::Isolated, "net1", &Map::new())
            .await
            .unwrap();
        cloud
            .instantiate_vapp("vdc1", "web", "web-1", &config(json!({"network": "net1"})))
            .await
            .unwrap();

        let err = cloud
            .delete_network("vdc1", NetworkType::Isolated, "net1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be deleted, because it is in use"));

        let nics = cloud.list_nics("vdc1", "web", "web-1").await.unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].child_text("ip_address").as_deref(), Some("10.0.0.10"));
    }

    #[tokio::test]
    async fn test_bad_computer_name() {
        let cloud = cloud();
        let err = cloud
            .instantiate_vapp("vdc1", "web", "web_1!", &Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Computer name can only contain"));
    }

    #[tokio::test]
    async fn test_power_off_twice() {
        let cloud = cloud();
        cloud
            .instantiate_vapp("vdc1", "web", "web-1", &Map::new())
            .await
            .unwrap();
        let err = cloud
            .power_vm("vdc1", "web", "web-1", PowerAction::PowerOff)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is not powered on"));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let cloud = cloud();
        cloud
            .create_disk("vdc1", "data", &config(json!({"size": 2048})))
            .await
            .unwrap();
        let restored = InMemoryCloud::from_json(&cloud.to_json().unwrap()).unwrap();
        let disk = restored.get_disk("vdc1", "data").await.unwrap();
        assert_eq!(disk.child_text("size").as_deref(), Some("2048"));
    }
}
