//! Plan/apply reconciliation against the orchestrator.
//!
//! ```text
//! compile ─▶ slices ─▶ read remote state ─▶ diff ─▶ approve ─▶ deploy ─▶ write state
//! ```
//!
//! Every deployable entity persists the canonical text of its own slice on the
//! remote side (services in a label, tasks in a labelled config). The "current"
//! stack is the union of those texts, so a stack that was applied and not
//! changed since compiles to exactly the current bytes.

pub mod remote;

pub use remote::{
    escape_name, ConfigFilter, ControlPlane, RemoteConfig, RemoteResponse, DSPP_NAMESPACE_LABEL,
    DSPP_STATE_LABEL, DSPP_TASK_NAME_LABEL, STACK_NAMESPACE_LABEL,
};

use crate::codec;
use crate::compile::{Compiler, EntityKind, EntitySlice, LocalAnalysis, SliceFilter};
use crate::document::loader::parse_fragment;
use crate::document::{self, key_string, CONFIGS, SECRETS, SERVICES, TASKS};
use crate::error::{DsppError, Result};
use crate::format::{format_stack, FormattedStack};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const PRUNE_CONCURRENCY: usize = 5;

/// Decides whether a pending change gets applied.
#[async_trait]
pub trait Approver: Send + Sync {
    /// Show the change from `current` to `compiled` and return the decision.
    async fn approve(&self, current: &str, compiled: &str) -> Result<bool>;
}

/// Approves every change without looking at it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _current: &str, _compiled: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Outcome of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    NoChange,
    PendingApproval,
    Approved,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub stack_revision: String,
    pub compiled: String,
    pub current: String,
    pub orphan_tasks: Vec<String>,
    pub status: PlanStatus,
}

/// What an apply did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub stack_revision: String,
    /// False when there was nothing to deploy
    pub deployed: bool,
    /// CAS path of the deployed stack text
    pub stack_path: Option<String>,
    /// Configs replaced by references to their existing remote copy
    pub externalized: usize,
    pub pruned_tasks: Vec<String>,
    pub states_written: usize,
}

/// Task state as stored on the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub id: String,
    pub name: String,
    pub image: Option<String>,
    /// Decoded slice text
    pub state: String,
}

/// Local slices plus the remote view of the same entities.
#[derive(Debug)]
pub struct Analysis {
    pub local: LocalAnalysis,
    pub stack_revision: String,
    pub compiled: String,
    pub current: String,
    pub orphan_tasks: Vec<String>,
}

/// Drives plan and apply for one stack.
pub struct Reconciler {
    compiler: Compiler,
    remote: Arc<dyn ControlPlane>,
    approved: Option<String>,
}

impl Reconciler {
    pub fn new(compiler: Compiler, remote: Arc<dyn ControlPlane>) -> Self {
        Self { compiler, remote, approved: None }
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Compiled bytes approved by the last plan, if any.
    pub fn approved(&self) -> Option<&str> {
        self.approved.as_deref()
    }

    fn stack_name(&self) -> &str {
        self.compiler.stack_name()
    }

    fn service_id(&self, service: &str) -> String {
        format!("{}_{}", self.stack_name(), service)
    }

    fn task_config_name(&self, task: &str) -> String {
        escape_name(&format!("{}_tasks.{}", self.stack_name(), task))
    }

    /// Every task state of this stack, keyed by task name.
    pub async fn tasks(&self) -> Result<BTreeMap<String, RemoteTask>> {
        let filter = ConfigFilter::namespace(self.stack_name()).with_label(DSPP_TASK_NAME_LABEL);
        let configs = self.remote.configs_list(&filter).await?;

        let mut tasks = BTreeMap::new();
        for config in configs {
            let Some(name) = config.label(DSPP_TASK_NAME_LABEL).map(str::to_string) else {
                continue;
            };
            let image = serde_json::from_slice::<serde_json::Value>(&config.data)
                .ok()
                .and_then(|body| body.get("image").and_then(|i| i.as_str()).map(str::to_string));
            let state = config.label(DSPP_STATE_LABEL).map(codec::decode).unwrap_or_default();
            tasks.insert(name.clone(), RemoteTask { id: config.id, name, image, state });
        }
        Ok(tasks)
    }

    async fn read_service_state(&self, service: &str) -> Result<String> {
        let labels = self.remote.service_labels_read(&self.service_id(service)).await?;
        if let Some(state) = labels.get(DSPP_STATE_LABEL).filter(|s| !s.is_empty()) {
            return Ok(codec::decode(state));
        }

        let legacy = escape_name(&format!("{}.dspp.{}", self.stack_name(), service));
        let state = self.remote.config_read(&legacy).await?;
        if state.is_some() {
            debug!("Read legacy state of service {} from {}", service, legacy);
        }
        Ok(state.map(|s| codec::decode(&s)).unwrap_or_default())
    }

    /// Compile locally and rebuild the current stack from remote state.
    #[instrument(skip(self, filter), fields(stack = %self.stack_name()))]
    pub async fn analyze(&self, filter: &SliceFilter) -> Result<Analysis> {
        let local = self.compiler.analyze_local(filter).await?;
        let prune = !filter.is_active();
        let needs_tasks = prune || local.slices.iter().any(|s| s.kind == EntityKind::Task);

        let mut remote_stack = Value::Mapping(Mapping::new());
        let mut orphan_tasks = Vec::new();

        let tasks = if needs_tasks {
            info!("Reading remote tasks state");
            self.tasks().await?
        } else {
            BTreeMap::new()
        };

        if prune {
            for (name, task) in &tasks {
                if local.slices.iter().any(|s| s.kind == EntityKind::Task && &s.name == name) {
                    continue;
                }
                orphan_tasks.push(name.clone());
                merge_state(&mut remote_stack, &task.state)?;
            }
        }

        info!("Reading ({}) remote entities", local.slices.len());
        let concurrency = self.compiler.config().concurrency.max(1);
        let states: Vec<String> = stream::iter(local.slices.iter())
            .map(|slice| {
                let tasks = &tasks;
                async move {
                    match slice.kind {
                        EntityKind::Service => self.read_service_state(&slice.name).await,
                        EntityKind::Task => {
                            Ok(tasks.get(&slice.name).map(|t| t.state.clone()).unwrap_or_default())
                        }
                    }
                }
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        for state in &states {
            merge_state(&mut remote_stack, state)?;
        }

        let current = format_stack(self.stack_name(), &remote_stack)?.compiled;
        let FormattedStack { stack_revision, compiled } =
            format_stack(self.stack_name(), &local.stack)?;

        Ok(Analysis { local, stack_revision, compiled, current, orphan_tasks })
    }

    /// Diff the compiled stack against the remote one and ask for approval.
    pub async fn plan(&mut self, filter: &SliceFilter, approver: &dyn Approver) -> Result<Plan> {
        if let Some(pattern) = &filter.pattern {
            info!("Filter stack for '{}'", pattern);
        }

        let analysis = self.analyze(filter).await?;
        let mut plan = Plan {
            stack_revision: analysis.stack_revision,
            compiled: analysis.compiled,
            current: analysis.current,
            orphan_tasks: analysis.orphan_tasks,
            status: PlanStatus::NoChange,
        };

        if filter.is_active() && analysis.local.slices.is_empty() {
            return Ok(plan);
        }
        if plan.current == plan.compiled || self.approved.as_deref() == Some(plan.compiled.as_str())
        {
            info!("No changes detected");
            return Ok(plan);
        }

        plan.status = if approver.approve(&plan.current, &plan.compiled).await? {
            info!("Approved @{}", plan.stack_revision);
            self.approved = Some(plan.compiled.clone());
            PlanStatus::Approved
        } else {
            PlanStatus::PendingApproval
        };
        Ok(plan)
    }

    /// Deploy the approved stack and persist per-entity state.
    #[instrument(skip(self, filter), fields(stack = %self.stack_name()))]
    pub async fn apply(&mut self, filter: &SliceFilter, force_config: bool) -> Result<ApplyReport> {
        let analysis = self.analyze(filter).await?;
        let mut report =
            ApplyReport { stack_revision: analysis.stack_revision.clone(), ..Default::default() };

        if analysis.current == analysis.compiled {
            info!("No changes detected");
            return Ok(report);
        }
        if self.approved.as_deref() != Some(analysis.compiled.as_str()) {
            return Err(DsppError::StaleApproval);
        }

        let Analysis { local, orphan_tasks, .. } = analysis;
        let LocalAnalysis { mut stack, slices, compiled: mut compiled_stack } = local;

        if !force_config {
            report.externalized = self.externalize_existing_configs(&mut stack).await?;
            if report.externalized > 0 {
                info!("Stripped {} existing configs from stack", report.externalized);
            }
        }

        if let Some(Value::Mapping(configs)) = stack.get_mut(CONFIGS) {
            for (_, config) in configs.iter_mut() {
                if let Value::Mapping(entry) = config {
                    entry.remove("x-trace");
                }
            }
        }
        let tasks = document::ensure_mapping(&mut stack).remove(TASKS).unwrap_or(Value::Null);

        let deployable = format_stack(self.stack_name(), &stack)?.compiled;
        let entry = compiled_stack.cas.feed(deployable.clone());
        compiled_stack.cas.write()?;
        info!(
            "Stack file written to {} ({})",
            entry.path,
            filter.pattern.as_deref().map(|p| format!("filter {}", p)).unwrap_or("full stack".into())
        );

        self.remote.deploy(&deployable, self.stack_name()).await?;
        self.approved = None;
        report.deployed = true;
        report.stack_path = Some(entry.path);

        for task in &orphan_tasks {
            let path = format!("/configs/{}", self.task_config_name(task));
            match self.remote.request("DELETE", &path).await {
                Ok(response) => {
                    info!("Pruning orphan task {} ({})", task, response.status);
                    if response.is_success() {
                        report.pruned_tasks.push(task.clone());
                    }
                }
                Err(e) => warn!("Could not prune orphan task {}: {}", task, e),
            }
        }

        let mut failed = Vec::new();
        for slice in &slices {
            match self.write_state(slice, &tasks).await {
                Ok(()) => report.states_written += 1,
                Err(e) => {
                    warn!("Could not write state of {} {}: {}", slice.kind, slice.name, e);
                    failed.push(slice.name.clone());
                }
            }
        }
        if !failed.is_empty() {
            return Err(DsppError::PartialDeploy { entities: failed });
        }
        Ok(report)
    }

    /// Point configs that already exist remotely at that copy.
    async fn externalize_existing_configs(&self, stack: &mut Value) -> Result<usize> {
        let prefix = format!("{}_", self.stack_name());
        let existing: BTreeSet<String> = self
            .remote
            .configs_list(&ConfigFilter::namespace(self.stack_name()))
            .await?
            .into_iter()
            .map(|c| c.name.strip_prefix(&prefix).map(str::to_string).unwrap_or(c.name))
            .collect();

        let reused: Vec<String> = document::entry_names(stack, CONFIGS)
            .into_iter()
            .filter(|name| existing.contains(name))
            .collect();

        let configs = document::section_mut(stack, CONFIGS);
        for name in &reused {
            configs.remove(name.as_str());
            let mut external = Mapping::new();
            external.insert(Value::from("external"), Value::from(true));
            configs.insert(Value::from(format!("{}{}", prefix, name)), Value::Mapping(external));
        }

        for section in [SERVICES, TASKS] {
            let Some(Value::Mapping(entities)) = stack.get_mut(section) else { continue };
            for (_, entity) in entities.iter_mut() {
                let Some(Value::Sequence(refs)) = entity.get_mut(CONFIGS) else { continue };
                for reference in refs.iter_mut() {
                    // Short syntax is the bare config name.
                    let source = if reference.is_string() {
                        reference
                    } else if let Some(source) = reference.get_mut("source") {
                        source
                    } else {
                        continue;
                    };
                    let renamed = source.as_str().filter(|s| reused.iter().any(|r| r == s));
                    if let Some(name) = renamed.map(|s| format!("{}{}", prefix, s)) {
                        *source = Value::from(name);
                    }
                }
            }
        }
        Ok(reused.len())
    }

    async fn write_state(&self, slice: &EntitySlice, tasks: &Value) -> Result<()> {
        let encoded = codec::encode(&slice.compiled)?;
        match slice.kind {
            EntityKind::Service => {
                self.remote
                    .service_label_write(&self.service_id(&slice.name), DSPP_STATE_LABEL, &encoded)
                    .await
            }
            EntityKind::Task => {
                let task = tasks.get(slice.name.as_str()).cloned().unwrap_or(Value::Null);
                let body = task_body(&slice.name, &task)?;
                let key = self.task_config_name(&slice.name);
                info!("Update task {} (id:{})", slice.name, key);

                let labels = BTreeMap::from([
                    (STACK_NAMESPACE_LABEL.to_string(), self.stack_name().to_string()),
                    (DSPP_NAMESPACE_LABEL.to_string(), "true".to_string()),
                    (DSPP_STATE_LABEL.to_string(), encoded),
                    (DSPP_TASK_NAME_LABEL.to_string(), slice.name.clone()),
                ]);
                self.remote.config_write(&key, &body, &labels).await
            }
        }
    }

    /// Delete remote configs of this stack that the compiled stack no longer uses.
    #[instrument(skip(self), fields(stack = %self.stack_name()))]
    pub async fn config_prune(&self) -> Result<Vec<String>> {
        let local = self.compiler.analyze_local(&SliceFilter::default()).await?;
        let legit: BTreeSet<String> = document::entry_names(&local.stack, CONFIGS)
            .into_iter()
            .chain(document::entry_names(&local.stack, SECRETS))
            .collect();
        let prefix = format!("{}_", self.stack_name());

        let configs = self.remote.configs_list(&ConfigFilter::namespace(self.stack_name())).await?;
        let stale: Vec<RemoteConfig> = configs
            .into_iter()
            .filter(|c| !legit.contains(c.name.strip_prefix(&prefix).unwrap_or(&c.name)))
            .filter(|c| c.label(DSPP_NAMESPACE_LABEL).is_none())
            .collect();

        let pruned: Vec<Option<String>> = stream::iter(stale)
            .map(|config| async move {
                match self.remote.request("DELETE", &format!("/configs/{}", config.id)).await {
                    Ok(response) => {
                        info!("Pruning {} {} ({})", config.id, config.name, response.status);
                        response.is_success().then_some(config.name)
                    }
                    Err(e) => {
                        warn!("Could not prune {}: {}", config.name, e);
                        None
                    }
                }
            })
            .buffer_unordered(PRUNE_CONCURRENCY)
            .collect()
            .await;

        let mut pruned: Vec<String> = pruned.into_iter().flatten().collect();
        pruned.sort();
        Ok(pruned)
    }

    pub async fn version(&self) -> Result<serde_json::Value> {
        self.remote.version().await
    }
}

/// Merge one decoded slice text into `stack`.
fn merge_state(stack: &mut Value, state: &str) -> Result<()> {
    if state.trim().is_empty() {
        return Ok(());
    }
    let doc = parse_fragment(Path::new("<remote state>"), state)?;
    if doc.is_mapping() {
        document::deep_merge(stack, doc);
    }
    Ok(())
}

/// JSON body of a task state config: the task spec plus its name.
fn task_body(name: &str, task: &Value) -> Result<String> {
    let mut body = Mapping::new();
    if let Value::Mapping(spec) = task {
        for (key, value) in spec {
            body.insert(Value::from(key_string(key)), value.clone());
        }
    }
    body.insert(Value::from("name"), Value::from(name));
    serde_json::to_string(&Value::Mapping(body))
        .map_err(|e| DsppError::SerializeFailed { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::secrets::NoSecrets;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Remote {
        configs: BTreeMap<String, RemoteConfig>,
        services: BTreeMap<String, BTreeMap<String, String>>,
        deployed: Vec<String>,
        deleted: Vec<String>,
    }

    /// In-memory control plane.
    #[derive(Default)]
    struct FakePlane {
        state: Mutex<Remote>,
        fail_labels: bool,
    }

    impl FakePlane {
        fn add_config(&self, name: &str, labels: &[(&str, &str)], data: &str) {
            let mut state = self.state.lock().unwrap();
            let config = RemoteConfig {
                id: format!("id-{}", name),
                name: name.to_string(),
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                data: data.as_bytes().to_vec(),
            };
            state.configs.insert(name.to_string(), config);
        }
    }

    #[async_trait]
    impl ControlPlane for FakePlane {
        async fn configs_list(&self, filter: &ConfigFilter) -> Result<Vec<RemoteConfig>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .configs
                .values()
                .filter(|c| filter.label.as_ref().map(|l| c.labels.contains_key(l)).unwrap_or(true))
                .filter(|c| {
                    filter.namespace.as_deref().map(|ns| c.label(STACK_NAMESPACE_LABEL) == Some(ns)).unwrap_or(true)
                })
                .filter(|c| filter.name.as_ref().map(|n| &c.name == n).unwrap_or(true))
                .cloned()
                .collect())
        }

        async fn config_read(&self, name: &str) -> Result<Option<String>> {
            let state = self.state.lock().unwrap();
            Ok(state.configs.get(name).map(|c| String::from_utf8_lossy(&c.data).into_owned()))
        }

        async fn config_write(&self, name: &str, body: &str, labels: &BTreeMap<String, String>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let config = RemoteConfig {
                id: format!("id-{}", name),
                name: name.to_string(),
                labels: labels.clone(),
                data: body.as_bytes().to_vec(),
            };
            state.configs.insert(name.to_string(), config);
            Ok(())
        }

        async fn service_labels_read(&self, name: &str) -> Result<BTreeMap<String, String>> {
            Ok(self.state.lock().unwrap().services.get(name).cloned().unwrap_or_default())
        }

        async fn service_label_write(&self, name: &str, key: &str, value: &str) -> Result<()> {
            if self.fail_labels {
                return Err(DsppError::RemoteUnavailable {
                    path: format!("/services/{}/update", name),
                    status: Some(500),
                    reason: "boom".into(),
                });
            }
            let mut state = self.state.lock().unwrap();
            state.services.entry(name.to_string()).or_default().insert(key.into(), value.into());
            Ok(())
        }

        async fn request(&self, method: &str, path: &str) -> Result<RemoteResponse> {
            let mut state = self.state.lock().unwrap();
            let target = path.trim_start_matches("/configs/").to_string();
            let before = state.configs.len();
            state.configs.retain(|name, c| !(method == "DELETE" && (name == &target || c.id == target)));
            let status = if state.configs.len() < before { 204 } else { 404 };
            state.deleted.push(target);
            Ok(RemoteResponse { status, body: String::new() })
        }

        async fn deploy(&self, compiled: &str, stack_name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.deployed.push(compiled.to_string());
            let doc: Value = serde_yaml::from_str(compiled).unwrap();
            for name in document::entry_names(&doc, CONFIGS) {
                if document::truthy(doc[CONFIGS][name.as_str()].get("external")) {
                    continue;
                }
                let full = format!("{}_{}", stack_name, name);
                let labels = BTreeMap::from([(STACK_NAMESPACE_LABEL.to_string(), stack_name.to_string())]);
                let config = RemoteConfig { id: format!("id-{}", full), name: full.clone(), labels, data: vec![] };
                state.configs.insert(full, config);
            }
            for name in document::entry_names(&doc, SERVICES) {
                state.services.entry(format!("{}_{}", stack_name, name)).or_default();
            }
            Ok(())
        }

        async fn version(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"Version": "24.0.7"}))
        }
    }

    struct Refuse;

    #[async_trait]
    impl Approver for Refuse {
        async fn approve(&self, _current: &str, _compiled: &str) -> Result<bool> {
            Ok(false)
        }
    }

    const STACK: &str = "\
name: shop
version: '3.8'
services:
  web:
    image: nginx
    configs:
      - {source: app_cfg, target: /etc/app.yml}
tasks:
  migrate:
    image: registry/migrate
configs:
  app_cfg: {contents: {port: 8080}, format: yaml}
";

    fn reconciler(body: &str, remote: Arc<FakePlane>) -> (TempDir, Reconciler) {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("stack.yml"), body).unwrap();
        let compiler = Compiler::new(temp.path(), Path::new("stack.yml"), Config::default())
            .unwrap()
            .with_secrets_provider(Arc::new(NoSecrets));
        (temp, Reconciler::new(compiler, remote))
    }

    #[tokio::test]
    async fn test_plan_apply_replan() {
        let remote = Arc::new(FakePlane::default());
        let (temp, mut reconciler) = reconciler(STACK, remote.clone());
        let filter = SliceFilter::default();

        let plan = reconciler.plan(&filter, &AutoApprove).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert!(plan.current.starts_with("# shop @"));

        let report = reconciler.apply(&filter, false).await.unwrap();
        assert!(report.deployed);
        assert_eq!(report.states_written, 2);
        assert!(temp.path().join(report.stack_path.unwrap()).exists());

        {
            let state = remote.state.lock().unwrap();
            assert_eq!(state.deployed.len(), 1);
            assert!(!state.deployed[0].contains("tasks:"));
            assert!(!state.deployed[0].contains("x-trace"));
            let label = &state.services["shop_web"][DSPP_STATE_LABEL];
            assert!(codec::decode(label).contains("image: nginx"));
            let task = &state.configs["shop_tasks.migrate"];
            let body: serde_json::Value = serde_json::from_slice(&task.data).unwrap();
            assert_eq!(body["name"], "migrate");
            assert_eq!(body["image"], "registry/migrate");
        }

        let plan = reconciler.plan(&filter, &Refuse).await.unwrap();
        assert_eq!(plan.status, PlanStatus::NoChange);
        assert_eq!(plan.current, plan.compiled);

        let tasks = reconciler.tasks().await.unwrap();
        assert_eq!(tasks["migrate"].image.as_deref(), Some("registry/migrate"));
    }

    #[tokio::test]
    async fn test_apply_requires_matching_approval() {
        let remote = Arc::new(FakePlane::default());
        let (temp, mut reconciler) = reconciler(STACK, remote.clone());
        let filter = SliceFilter::default();

        let err = reconciler.apply(&filter, false).await.unwrap_err();
        assert!(matches!(err, DsppError::StaleApproval));

        let plan = reconciler.plan(&filter, &Refuse).await.unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        assert!(reconciler.approved().is_none());

        reconciler.plan(&filter, &AutoApprove).await.unwrap();
        std::fs::write(temp.path().join("stack.yml"), STACK.replace("image: nginx", "image: httpd")).unwrap();
        let err = reconciler.apply(&filter, false).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(remote.state.lock().unwrap().deployed.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_tasks_are_planned_and_pruned() {
        let remote = Arc::new(FakePlane::default());
        let old = codec::encode("tasks:\n  cleanup:\n    image: registry/cleanup\n").unwrap();
        remote.add_config(
            "shop_tasks.cleanup",
            &[
                (STACK_NAMESPACE_LABEL, "shop"),
                (DSPP_NAMESPACE_LABEL, "true"),
                (DSPP_STATE_LABEL, &old),
                (DSPP_TASK_NAME_LABEL, "cleanup"),
            ],
            "{\"image\":\"registry/cleanup\",\"name\":\"cleanup\"}",
        );
        let (_temp, mut reconciler) = reconciler(STACK, remote.clone());
        let filter = SliceFilter::default();

        let plan = reconciler.plan(&filter, &AutoApprove).await.unwrap();
        assert_eq!(plan.orphan_tasks, vec!["cleanup".to_string()]);
        assert!(plan.current.contains("registry/cleanup"));

        let report = reconciler.apply(&filter, false).await.unwrap();
        assert_eq!(report.pruned_tasks, vec!["cleanup".to_string()]);
        assert!(!remote.state.lock().unwrap().configs.contains_key("shop_tasks.cleanup"));
    }

    #[tokio::test]
    async fn test_filtered_plan_ignores_orphans() {
        let remote = Arc::new(FakePlane::default());
        remote.add_config(
            "shop_tasks.cleanup",
            &[(STACK_NAMESPACE_LABEL, "shop"), (DSPP_TASK_NAME_LABEL, "cleanup")],
            "{}",
        );
        let (_temp, mut reconciler) = reconciler(STACK, remote);

        let plan = reconciler.plan(&SliceFilter::new(Some("^web$")), &AutoApprove).await.unwrap();
        assert!(plan.orphan_tasks.is_empty());
        assert!(!plan.compiled.contains("migrate"));

        let plan = reconciler.plan(&SliceFilter::new(Some("nothing")), &AutoApprove).await.unwrap();
        assert_eq!(plan.status, PlanStatus::NoChange);
    }

    #[tokio::test]
    async fn test_legacy_service_state() {
        let remote = Arc::new(FakePlane::default());
        let (_temp, reconciler) = reconciler(STACK, remote.clone());
        remote.add_config("shop.dspp.web", &[], "services:\n  web:\n    image: legacy\n");

        let analysis = reconciler.analyze(&SliceFilter::new(Some("^web$"))).await.unwrap();
        assert!(analysis.current.contains("image: legacy"));
    }

    #[tokio::test]
    async fn test_existing_configs_are_externalized() {
        let remote = Arc::new(FakePlane::default());
        let (_temp, mut reconciler) = reconciler(STACK, remote.clone());
        let filter = SliceFilter::default();

        reconciler.plan(&filter, &AutoApprove).await.unwrap();
        reconciler.apply(&filter, false).await.unwrap();
        remote.state.lock().unwrap().services.clear();

        reconciler.plan(&filter, &AutoApprove).await.unwrap();
        let report = reconciler.apply(&filter, false).await.unwrap();
        assert_eq!(report.externalized, 1);

        let state = remote.state.lock().unwrap();
        let doc: Value = serde_yaml::from_str(&state.deployed[1]).unwrap();
        let source = doc["services"]["web"]["configs"][0]["source"].as_str().unwrap();
        assert!(source.starts_with("shop_app_cfg-"));
        assert_eq!(doc["configs"][source]["external"], Value::from(true));
    }

    #[tokio::test]
    async fn test_short_syntax_refs_are_externalized() {
        let remote = Arc::new(FakePlane::default());
        let body = STACK.replace("- {source: app_cfg, target: /etc/app.yml}", "- app_cfg");
        let (_temp, mut reconciler) = reconciler(&body, remote.clone());
        let filter = SliceFilter::default();

        reconciler.plan(&filter, &AutoApprove).await.unwrap();
        reconciler.apply(&filter, false).await.unwrap();
        remote.state.lock().unwrap().services.clear();

        reconciler.plan(&filter, &AutoApprove).await.unwrap();
        let report = reconciler.apply(&filter, false).await.unwrap();
        assert_eq!(report.externalized, 1);

        let state = remote.state.lock().unwrap();
        let doc: Value = serde_yaml::from_str(&state.deployed[1]).unwrap();
        let source = doc["services"]["web"]["configs"][0].as_str().unwrap();
        assert!(source.starts_with("shop_app_cfg-"));
        assert_eq!(doc["configs"][source]["external"], Value::from(true));
    }

    #[tokio::test]
    async fn test_state_write_failures_are_reported() {
        let remote = Arc::new(FakePlane { fail_labels: true, ..Default::default() });
        let (_temp, mut reconciler) = reconciler(STACK, remote.clone());
        let filter = SliceFilter::default();

        reconciler.plan(&filter, &AutoApprove).await.unwrap();
        let err = reconciler.apply(&filter, false).await.unwrap_err();
        match err {
            DsppError::PartialDeploy { entities } => assert_eq!(entities, vec!["web".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        let state = remote.state.lock().unwrap();
        assert_eq!(state.deployed.len(), 1);
        assert!(state.configs.contains_key("shop_tasks.migrate"));
    }

    #[tokio::test]
    async fn test_config_prune() {
        let remote = Arc::new(FakePlane::default());
        let (_temp, reconciler) = reconciler(STACK, remote.clone());
        let local = reconciler.compiler().analyze_local(&SliceFilter::default()).await.unwrap();
        let live = document::entry_names(&local.stack, CONFIGS).remove(0);

        remote.add_config(&format!("shop_{}", live), &[(STACK_NAMESPACE_LABEL, "shop")], "");
        remote.add_config("shop_app_cfg-00000", &[(STACK_NAMESPACE_LABEL, "shop")], "");
        remote.add_config("shop_tasks.migrate", &[(STACK_NAMESPACE_LABEL, "shop"), (DSPP_NAMESPACE_LABEL, "true")], "");
        remote.add_config("other_app_cfg-00000", &[(STACK_NAMESPACE_LABEL, "other")], "");

        let pruned = reconciler.config_prune().await.unwrap();
        assert_eq!(pruned, vec!["shop_app_cfg-00000".to_string()]);
        assert_eq!(remote.state.lock().unwrap().configs.len(), 3);
    }

    #[test]
    fn test_task_body() {
        let task: Value = serde_yaml::from_str("image: x\ncommand: run").unwrap();
        let body: serde_json::Value = serde_json::from_str(&task_body("migrate", &task).unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"image": "x", "command": "run", "name": "migrate"}));
    }
}
