//! Orchestrator control plane abstraction.
//!
//! The reconciler never talks to the orchestrator directly. Everything it
//! needs from the remote side goes through the `ControlPlane` trait:
//! - labelled configs (task state, legacy service state)
//! - service labels (service state)
//! - a raw request escape hatch (deletes)
//! - the blocking stack deploy

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Stack namespace label set by the orchestrator on every stack object.
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";
/// Marks objects owned by dspp itself (state holders, not user configs).
pub const DSPP_NAMESPACE_LABEL: &str = "dspp.namespace";
/// Encoded compiled slice of a service or task.
pub const DSPP_STATE_LABEL: &str = "dspp.state";
/// Task name carried by task state configs.
pub const DSPP_TASK_NAME_LABEL: &str = "dspp.task.name";

/// Replace characters the orchestrator rejects in object names.
pub fn escape_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' })
        .collect()
}

/// Config listing filter. Unset fields do not constrain the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFilter {
    /// Only configs carrying this label (any value)
    pub label: Option<String>,
    /// Only configs of this stack namespace
    pub namespace: Option<String>,
    /// Only the config with this exact name
    pub name: Option<String>,
}

impl ConfigFilter {
    pub fn namespace(stack_name: &str) -> Self {
        Self { namespace: Some(stack_name.to_string()), ..Default::default() }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// A config object as stored by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Decoded config body
    pub data: Vec<u8>,
}

impl RemoteConfig {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Raw control plane response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Control plane trait.
///
/// The CLI implements it against the engine HTTP API; tests use in-memory fakes.
/// Implementations report transport failures and non-2xx answers as
/// `DsppError::RemoteUnavailable`, except where a method documents otherwise.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// List configs matching `filter`.
    async fn configs_list(&self, filter: &ConfigFilter) -> Result<Vec<RemoteConfig>>;

    /// Read a config body by name. `None` when the config does not exist.
    async fn config_read(&self, name: &str) -> Result<Option<String>>;

    /// Create or replace a config.
    ///
    /// Configs are immutable remotely, so implementations delete any existing
    /// config of that name first.
    async fn config_write(
        &self,
        name: &str,
        body: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Labels of a service. Empty when the service does not exist yet.
    async fn service_labels_read(&self, name: &str) -> Result<BTreeMap<String, String>>;

    /// Set one label on an existing service.
    async fn service_label_write(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Issue a raw request. Non-2xx statuses are returned, not raised.
    async fn request(&self, method: &str, path: &str) -> Result<RemoteResponse>;

    /// Deploy the canonical stack text as `stack_name`. Blocks until done.
    async fn deploy(&self, compiled: &str, stack_name: &str) -> Result<()>;

    /// Control plane version report.
    async fn version(&self) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_name() {
        assert_eq!(escape_name("shop_tasks.migrate"), "shop_tasks.migrate");
        assert_eq!(escape_name("shop.dspp.web/api v2"), "shop.dspp.web_api_v2");
        assert_eq!(escape_name("a:b@c"), "a_b_c");
    }

    #[test]
    fn test_filter_builders() {
        let filter = ConfigFilter::namespace("shop")
            .with_label(DSPP_TASK_NAME_LABEL)
            .with_name("shop_tasks.migrate");
        assert_eq!(filter.namespace.as_deref(), Some("shop"));
        assert_eq!(filter.label.as_deref(), Some("dspp.task.name"));
        assert_eq!(filter.name.as_deref(), Some("shop_tasks.migrate"));
    }

    #[test]
    fn test_response_status() {
        assert!(RemoteResponse { status: 204, body: String::new() }.is_success());
        assert!(!RemoteResponse { status: 404, body: String::new() }.is_success());
    }
}
