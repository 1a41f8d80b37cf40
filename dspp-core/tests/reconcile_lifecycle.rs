//! Plan/apply lifecycle against an in-memory control plane.
//!
//! Run with:
//! ```bash
//! cargo test --test reconcile_lifecycle
//! ```

use async_trait::async_trait;
use dspp_core::reconcile::{DSPP_STATE_LABEL, DSPP_TASK_NAME_LABEL, STACK_NAMESPACE_LABEL};
use dspp_core::{
    AutoApprove, Compiler, Config, ConfigFilter, ControlPlane, NoSecrets, PlanStatus, Reconciler,
    RemoteConfig, RemoteResponse, Result, SliceFilter,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Mock control plane keeping configs and service labels in memory.
#[derive(Default)]
struct MockPlane {
    configs: Mutex<BTreeMap<String, RemoteConfig>>,
    labels: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    deploys: Mutex<Vec<String>>,
}

#[async_trait]
impl ControlPlane for MockPlane {
    async fn configs_list(&self, filter: &ConfigFilter) -> Result<Vec<RemoteConfig>> {
        let configs = self.configs.lock().unwrap();
        Ok(configs
            .values()
            .filter(|c| filter.label.as_ref().map(|l| c.labels.contains_key(l)).unwrap_or(true))
            .filter(|c| match &filter.namespace {
                Some(ns) => c.label(STACK_NAMESPACE_LABEL) == Some(ns.as_str()),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn config_read(&self, name: &str) -> Result<Option<String>> {
        let configs = self.configs.lock().unwrap();
        Ok(configs.get(name).map(|c| String::from_utf8_lossy(&c.data).into_owned()))
    }

    async fn config_write(&self, name: &str, body: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let config = RemoteConfig {
            id: name.to_string(),
            name: name.to_string(),
            labels: labels.clone(),
            data: body.as_bytes().to_vec(),
        };
        self.configs.lock().unwrap().insert(name.to_string(), config);
        Ok(())
    }

    async fn service_labels_read(&self, name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.labels.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn service_label_write(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut labels = self.labels.lock().unwrap();
        labels.entry(name.to_string()).or_default().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn request(&self, _method: &str, path: &str) -> Result<RemoteResponse> {
        let id = path.trim_start_matches("/configs/");
        let removed = self.configs.lock().unwrap().remove(id).is_some();
        Ok(RemoteResponse { status: if removed { 204 } else { 404 }, body: String::new() })
    }

    async fn deploy(&self, compiled: &str, _stack_name: &str) -> Result<()> {
        self.deploys.lock().unwrap().push(compiled.to_string());
        Ok(())
    }

    async fn version(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({"Version": "mock"}))
    }
}

const STACK: &str = "\
name: shop
version: '3.8'
includes:
  - parts/*.yml
services:
  web:
    image: nginx:$${tag}
    configs:
      - {source: app_cfg, target: /etc/app.yml}
tag: '1.25'
";

const PARTS: &str = "\
configs:
  app_cfg: {contents: {port: 8080}, format: yaml}
tasks:
  migrate:
    image: registry/migrate
    command: migrate $$stack_name
";

fn setup() -> (TempDir, Arc<MockPlane>, Reconciler) {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("parts")).unwrap();
    std::fs::write(temp.path().join("stack.yml"), STACK).unwrap();
    std::fs::write(temp.path().join("parts/app.yml"), PARTS).unwrap();

    let compiler = Compiler::new(temp.path(), Path::new("stack.yml"), Config::default())
        .unwrap()
        .with_secrets_provider(Arc::new(NoSecrets));
    let remote = Arc::new(MockPlane::default());
    let reconciler = Reconciler::new(compiler, remote.clone());
    (temp, remote, reconciler)
}

/// Re-planning right after an apply finds nothing to do.
#[tokio::test]
async fn test_plan_apply_replan_is_noop() {
    let (_temp, remote, mut reconciler) = setup();
    let filter = SliceFilter::default();

    let plan = reconciler.plan(&filter, &AutoApprove).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Approved);
    assert!(plan.compiled.contains("image: nginx:1.25"));
    assert!(plan.compiled.contains("command: migrate shop"));

    let report = reconciler.apply(&filter, false).await.unwrap();
    assert!(report.deployed);
    assert_eq!(report.states_written, 2);
    assert!(reconciler.approved().is_none());

    assert!(remote.labels.lock().unwrap()["shop_web"].contains_key(DSPP_STATE_LABEL));
    let task = remote.configs.lock().unwrap()["shop_tasks.migrate"].clone();
    assert_eq!(task.label(DSPP_TASK_NAME_LABEL), Some("migrate"));

    let replan = reconciler.plan(&filter, &AutoApprove).await.unwrap();
    assert_eq!(replan.status, PlanStatus::NoChange);
    assert_eq!(replan.current, replan.compiled);

    // Nothing changed, so apply deploys nothing.
    let report = reconciler.apply(&filter, false).await.unwrap();
    assert!(!report.deployed);
    assert_eq!(remote.deploys.lock().unwrap().len(), 1);
}

/// A fragment edit after apply shows up as a pending change again.
#[tokio::test]
async fn test_edit_after_apply_is_planned() {
    let (temp, _remote, mut reconciler) = setup();
    let filter = SliceFilter::default();

    reconciler.plan(&filter, &AutoApprove).await.unwrap();
    reconciler.apply(&filter, false).await.unwrap();

    let touched = reconciler.compiler().sources().update("tag", "1.27").unwrap();
    assert_eq!(touched.len(), 1);
    assert!(touched[0].ends_with("stack.yml"));
    assert!(std::fs::read_to_string(temp.path().join("stack.yml")).unwrap().contains("1.27"));

    let plan = reconciler.plan(&filter, &AutoApprove).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Approved);
    assert!(plan.current.contains("nginx:1.25"));
    assert!(plan.compiled.contains("nginx:1.27"));
}
