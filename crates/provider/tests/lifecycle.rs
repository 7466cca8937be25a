//! Lifecycle scenarios driven through the plugin against the in-memory cloud

use serde_json::{json, Map, Value};
use std::sync::Arc;
use vcloud_common::{Error, ProviderError, RuntimeProperties};
use vcloud_provider::resolver;
use vcloud_provider::simulator::TaskScript;
use vcloud_provider::{
    Completion, InMemoryCloud, InstanceContext, MemoryStateStore, NodeContext, OperationContext,
    Plugin, PluginConfig, RelationshipSide, SharedConnector, VcdClient,
};

const LIFECYCLE: &str = "cloudify.interfaces.lifecycle";
const RELATIONSHIP: &str = "cloudify.interfaces.relationship_lifecycle";

struct Harness {
    cloud: Arc<InMemoryCloud>,
    store: Arc<MemoryStateStore>,
    plugin: Plugin,
}

impl Harness {
    fn new(cloud: InMemoryCloud) -> Self {
        let cloud = Arc::new(cloud);
        let store = Arc::new(MemoryStateStore::new());
        let plugin = Plugin::new(
            Arc::new(SharedConnector::new(cloud.clone())),
            store.clone(),
            PluginConfig::default(),
        );
        Self {
            cloud,
            store,
            plugin,
        }
    }

    fn bag(&self, node: &InstanceContext) -> RuntimeProperties {
        self.store.get(&node.instance_id).unwrap_or_default()
    }

    async fn node_op(
        &self,
        node: &InstanceContext,
        verb: &str,
        retry: u32,
    ) -> vcloud_common::Result<vcloud_provider::OperationReport> {
        let ctx = OperationContext::node_instance(format!("{}.{}", LIFECYCLE, verb), node.clone())
            .with_retry(retry);
        self.plugin.invoke(ctx).await
    }

    async fn relationship_op(
        &self,
        source: &InstanceContext,
        target: &InstanceContext,
        verb: &str,
        retry: u32,
    ) -> vcloud_common::Result<vcloud_provider::OperationReport> {
        let ctx = OperationContext::relationship(
            format!("{}.{}", RELATIONSHIP, verb),
            source.clone(),
            target.clone(),
            RelationshipSide::Source,
        )
        .with_retry(retry);
        self.plugin.invoke(ctx).await
    }
}

fn cloud() -> InMemoryCloud {
    InMemoryCloud::new()
        .with_vdc("vdc1")
        .with_gateway("vdc1", "edge1", "203.0.113.1")
}

fn node(kind: &str, resource_id: &str, resource_config: Value) -> InstanceContext {
    InstanceContext {
        node: NodeContext {
            id: resource_id.to_string(),
            type_hierarchy: vec![
                format!("cloudify.nodes.vcloud.{}", kind),
                "cloudify.nodes.Root".to_string(),
            ],
            properties: json!({
                "resource_id": resource_id,
                "resource_config": resource_config,
                "client_config": {
                    "uri": "https://vcd.local",
                    "user": "admin",
                    "password": "secret",
                    "org": "acme",
                    "vdc": "vdc1",
                },
            })
            .as_object()
            .cloned()
            .unwrap(),
        },
        instance_id: format!("{}_q7w8e9", resource_id),
        runtime_properties: Map::new(),
        relationships: vec![],
    }
}

fn external(mut instance: InstanceContext) -> InstanceContext {
    instance
        .node
        .properties
        .insert("use_external_resource".into(), json!(true));
    instance
}

fn busy(what: &str) -> ProviderError {
    ProviderError::bad_request(
        "BUSY_ENTITY",
        format!("{} is busy, cannot proceed with the operation.", what),
    )
}

#[tokio::test]
async fn test_plain_retry_adopts_instead_of_creating_again() {
    let h = Harness::new(cloud());
    let net = node("IsolatedVDCNetwork", "net1", json!({"gateway_ip": "192.168.10.1"}));

    // The create task fails in a way that is retried without the sticky flag
    h.cloud
        .script_next_task(TaskScript::Fail("Lease expired during deploy".into()));
    let err = h.node_op(&net, "create", 0).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!h.bag(&net).contains_key("__RETRY_BAD_REQUEST"));

    let report = h.node_op(&net, "create", 1).await.unwrap();

    assert_eq!(report.completion, Completion::Completed);
    assert_eq!(h.cloud.calls("create_network"), 1);
    let bag = h.bag(&net);
    assert_eq!(bag["__created"], json!(true));
    assert_eq!(bag["resource_id"], json!("net1"));
    assert_eq!(bag["network"], json!("net1"));
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let h = Harness::new(cloud());
    let net = node("IsolatedVDCNetwork", "net1", json!({}));

    h.cloud.fail_next("create_network", busy("Network net1"));
    let err = h.node_op(&net, "create", 0).await.unwrap_err();
    assert!(matches!(err, Error::Retry(_)));
    assert_eq!(h.bag(&net)["__RETRY_BAD_REQUEST"], json!(true));

    // The sticky flag keeps the next attempt on the managed path
    let mut retry = OperationContext::node_instance(format!("{}.create", LIFECYCLE), net.clone())
        .with_retry(1);
    retry.refresh(h.store.as_ref()).unwrap();
    let connector = SharedConnector::new(h.cloud.clone());
    let data = resolver::resolve(&retry, &connector).unwrap();
    assert!(!data.primary.external);

    h.node_op(&net, "create", 1).await.unwrap();

    assert_eq!(h.cloud.calls("create_network"), 2);
    let bag = h.bag(&net);
    assert_eq!(bag["__created"], json!(true));
    assert_eq!(bag["__RETRY_BAD_REQUEST"], json!(false));
    assert!(h.cloud.get_network("vdc1", vcloud_common::NetworkType::Isolated, "net1").await.is_ok());
}

#[tokio::test]
async fn test_not_found_is_tolerated_for_stop() {
    let h = Harness::new(cloud());
    let vm = node("VM", "ghost", json!({"vapp": "nowhere"}));

    let report = h.node_op(&vm, "stop", 0).await.unwrap();

    assert_eq!(report.completion, Completion::NotFoundIgnored);
    assert_eq!(h.cloud.calls("power_vm"), 2);
}

#[tokio::test]
async fn test_not_found_is_fatal_for_start() {
    let h = Harness::new(cloud());
    let vm = node("VM", "ghost", json!({"vapp": "nowhere"}));

    let err = h.node_op(&vm, "start", 0).await.unwrap_err();

    assert!(matches!(err, Error::NonRecoverable(_)));
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn test_delete_leaves_only_the_deleted_marker() {
    let h = Harness::new(cloud());
    let vapp = node("VApp", "web", json!({"description": "web tier"}));

    h.node_op(&vapp, "create", 0).await.unwrap();
    assert!(h.bag(&vapp).len() > 1);

    let report = h.node_op(&vapp, "delete", 0).await.unwrap();

    assert_eq!(report.completion, Completion::Completed);
    assert_eq!(Value::Object(h.bag(&vapp)), json!({"__deleted": true}));
    assert!(h.cloud.get_vapp("vdc1", "web").await.is_err());
}

#[tokio::test]
async fn test_existing_disk_is_adopted_on_duplicate_create() {
    let h = Harness::new(cloud());
    h.cloud
        .create_disk("vdc1", "data", &json!({"size": 4096}).as_object().cloned().unwrap())
        .await
        .unwrap();
    let existing = h.cloud.get_disk("vdc1", "data").await.unwrap();
    let disk = node("Disk", "data", json!({"size": 4096}));

    let report = h.node_op(&disk, "create", 0).await.unwrap();

    assert_eq!(report.completion, Completion::Completed);
    assert_eq!(h.cloud.calls("create_disk"), 2);
    let bag = h.bag(&disk);
    assert_eq!(bag["__created"], json!(true));
    assert_eq!(bag["data"]["href"].as_str(), existing.attr("href"));
    assert_eq!(bag["data"]["id"].as_str(), existing.attr("id"));
}

#[tokio::test]
async fn test_external_gateway_create_is_a_lookup() {
    let h = Harness::new(cloud());
    let gateway = external(node("Gateway", "edge1", json!({})));

    h.node_op(&gateway, "create", 0).await.unwrap();

    let bag = h.bag(&gateway);
    assert_eq!(bag["__created"], json!(true));
    assert_eq!(bag["resource_id"], json!("edge1"));
    assert!(h.cloud.calls("get_gateway") >= 1);
    assert_eq!(h.cloud.calls("add_gateway_rule"), 0);
}

#[tokio::test]
async fn test_vm_that_created_its_vapp_deletes_it() {
    let h = Harness::new(cloud());
    let vm = node("VM", "web-1", json!({"cpu": 2}));

    h.node_op(&vm, "create", 0).await.unwrap();
    assert_eq!(h.cloud.calls("instantiate_vapp"), 1);
    assert_eq!(h.bag(&vm)["__VM_CREATE_VAPP"], json!(true));

    h.node_op(&vm, "delete", 0).await.unwrap();

    assert_eq!(h.cloud.calls("delete_vm"), 1);
    assert_eq!(h.cloud.calls("delete_vapp"), 1);
    assert!(h.cloud.get_vapp("vdc1", "web-1").await.is_err());
    assert_eq!(Value::Object(h.bag(&vm)), json!({"__deleted": true}));
}

#[tokio::test]
async fn test_vm_delete_retries_while_power_off_is_running() {
    let h = Harness::new(cloud());
    let vm = node("VM", "web-3", json!({}));
    h.node_op(&vm, "create", 0).await.unwrap();
    h.node_op(&vm, "start", 0).await.unwrap();

    h.cloud.script_next_task(TaskScript::Running);
    let err = h.node_op(&vm, "delete", 0).await.unwrap_err();

    assert!(matches!(err, Error::Retry(_)));
    assert_eq!(h.bag(&vm)["__RETRY_BAD_REQUEST"], json!(true));
    assert_eq!(h.cloud.calls("delete_vapp"), 0);

    h.node_op(&vm, "delete", 1).await.unwrap();

    assert_eq!(h.cloud.calls("delete_vapp"), 1);
    assert!(h.cloud.get_vapp("vdc1", "web-3").await.is_err());
    assert_eq!(Value::Object(h.bag(&vm)), json!({"__deleted": true}));
}

#[tokio::test]
async fn test_vm_in_shared_vapp_leaves_it_alone() {
    let h = Harness::new(cloud());
    h.cloud.create_vapp("vdc1", "shared", &Map::new()).await.unwrap();
    let vm = node("VM", "web-2", json!({"vapp": "shared"}));

    h.node_op(&vm, "create", 0).await.unwrap();
    assert_eq!(h.cloud.calls("add_vm"), 1);
    assert!(!h.bag(&vm).contains_key("__VM_CREATE_VAPP"));

    h.node_op(&vm, "delete", 0).await.unwrap();

    assert_eq!(h.cloud.calls("delete_vapp"), 0);
    assert!(h.cloud.get_vapp("vdc1", "shared").await.is_ok());
    assert!(h.cloud.get_vm("vdc1", "shared", "web-2").await.is_err());
}

#[tokio::test]
async fn test_nic_is_plugged_and_unplugged() {
    let h = Harness::new(cloud());
    for name in ["net1", "net2"] {
        h.node_op(&node("IsolatedVDCNetwork", name, json!({})), "create", 0)
            .await
            .unwrap();
    }
    let vm = node("VM", "app-1", json!({"network": "net1"}));
    h.node_op(&vm, "create", 0).await.unwrap();
    let nic = node("NIC", "nic2", json!({"network_name": "net2"}));
    h.node_op(&nic, "create", 0).await.unwrap();

    h.relationship_op(&nic, &vm, "configure", 0).await.unwrap();

    let bag = h.bag(&nic);
    assert_eq!(bag["nic_index"], json!(1));
    assert_eq!(bag["port"]["network"], json!("net2"));
    assert_eq!(h.cloud.list_nics("vdc1", "app-1", "app-1").await.unwrap().len(), 2);

    // Configuring again finds the recorded index
    h.relationship_op(&nic, &vm, "configure", 0).await.unwrap();
    assert_eq!(h.cloud.calls("add_nic"), 1);

    h.relationship_op(&nic, &vm, "unlink", 0).await.unwrap();

    let bag = h.bag(&nic);
    assert!(!bag.contains_key("nic_index"));
    assert!(!bag.contains_key("port"));
    assert_eq!(h.cloud.list_nics("vdc1", "app-1", "app-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_nic_retry_reuses_the_nic_it_added() {
    let h = Harness::new(cloud());
    h.node_op(&node("IsolatedVDCNetwork", "net1", json!({})), "create", 0)
        .await
        .unwrap();
    let vm = node("VM", "app-1", json!({"network": "net1"}));
    h.node_op(&vm, "create", 0).await.unwrap();
    let nic = node("NIC", "nic1", json!({"network_name": "net1"}));
    h.node_op(&nic, "create", 0).await.unwrap();

    // The add lands but its task is still running at the deadline
    h.cloud.script_next_task(TaskScript::Running);
    let err = h.relationship_op(&nic, &vm, "configure", 0).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.bag(&nic)["__RETRY_BAD_REQUEST"], json!(true));
    assert!(!h.bag(&nic).contains_key("nic_index"));

    h.relationship_op(&nic, &vm, "configure", 1).await.unwrap();

    assert_eq!(h.cloud.calls("add_nic"), 1);
    let bag = h.bag(&nic);
    assert_eq!(bag["nic_index"], json!(1));
    assert!(!bag.contains_key("__NIC_PRIOR_INDEXES"));

    h.relationship_op(&nic, &vm, "unlink", 0).await.unwrap();

    let remaining = h.cloud.list_nics("vdc1", "app-1", "app-1").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].child_text("index").as_deref(), Some("0"));
}

#[tokio::test]
async fn test_media_without_file_is_a_config_error() {
    let h = Harness::new(cloud().with_catalog("isos"));
    let media = node("Media", "seed.iso", json!({"catalog_name": "isos"}));

    let err = h.node_op(&media, "create", 0).await.unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(h.cloud.calls("upload_media"), 0);
}

#[tokio::test]
async fn test_media_upload_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let iso = dir.path().join("seed.iso");
    std::fs::write(&iso, vec![0u8; 2048]).unwrap();

    let h = Harness::new(cloud().with_catalog("isos"));
    let media = node(
        "Media",
        "seed.iso",
        json!({"catalog_name": "isos", "file_name": iso.to_str().unwrap()}),
    );

    h.node_op(&media, "create", 0).await.unwrap();

    assert!(h.cloud.get_catalog_item("isos", "seed.iso").await.is_ok());
    assert_eq!(h.bag(&media)["__created"], json!(true));
}

#[tokio::test]
async fn test_media_upload_of_generated_iso() {
    let h = Harness::new(cloud().with_catalog("isos"));
    let mut media = node("Media", "cidata.iso", json!({"catalog_name": "isos"}));
    media.node.properties.insert(
        "iso".into(),
        json!({
            "vol_ident": "cidata",
            "sys_ident": "",
            "files": {"ISO/FOLDER/content.json": "test content"},
        }),
    );

    h.node_op(&media, "create", 0).await.unwrap();

    assert_eq!(h.cloud.calls("upload_media"), 1);
    let snapshot = h.cloud.snapshot();
    let item = &snapshot.catalogs["isos"]["cidata.iso"];
    assert_eq!(item.bytes % 2048, 0);
    assert!(item.bytes >= 2048 * 19);
    assert!(!std::path::Path::new(&item.file_name).exists());
    assert_eq!(h.bag(&media)["__created"], json!(true));
}

#[tokio::test]
async fn test_missing_credentials_fail_before_any_call() {
    let h = Harness::new(cloud());
    let mut net = node("IsolatedVDCNetwork", "net1", json!({}));
    net.node.properties["client_config"]
        .as_object_mut()
        .unwrap()
        .remove("password");

    let err = h.node_op(&net, "create", 0).await.unwrap_err();

    assert!(matches!(err, Error::MissingConfigKey(ref key) if key == "password"));
    assert_eq!(h.cloud.calls("create_network"), 0);
}
