//! HTTP client for the Docker engine API

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use dspp_core::reconcile::{ConfigFilter, ControlPlane, RemoteConfig, RemoteResponse};
use dspp_core::{Config, DsppError, Result};
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tower::service_fn;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigObject {
    #[serde(rename = "ID")]
    id: String,
    spec: ConfigSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ConfigSpec {
    name: String,
    labels: Option<BTreeMap<String, String>>,
    data: Option<String>,
}

impl ConfigObject {
    fn into_remote(self) -> RemoteConfig {
        let data = self.spec.data.and_then(|d| STANDARD.decode(d).ok()).unwrap_or_default();
        RemoteConfig {
            id: self.id,
            name: self.spec.name,
            labels: self.spec.labels.unwrap_or_default(),
            data,
        }
    }
}

/// Engine socket connection handed to the HTTP client.
struct SocketStream(TokioIo<UnixStream>);

impl Connection for SocketStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for SocketStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, buf)
    }
}

impl hyper::rt::Write for SocketStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

/// How requests reach the engine.
enum Transport {
    Tcp(reqwest::Client),
    /// Local engine socket, e.g. `/var/run/docker.sock`.
    Unix(PathBuf),
}

/// Docker engine client
pub struct DockerClient {
    transport: Transport,
    base_url: Url,
    docker_bin: String,
}

impl DockerClient {
    /// Build a client for `config.docker_host`
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let host = config.docker_host.trim_end_matches('/');
        let (transport, base_url) = if let Some(socket) = host.strip_prefix("unix://") {
            // The authority is ignored by the socket connector; it only fills the Host header.
            (Transport::Unix(PathBuf::from(socket)), "http://localhost".to_string())
        } else if let Some(rest) = host.strip_prefix("tcp://") {
            (Transport::Tcp(reqwest::Client::new()), format!("http://{}", rest))
        } else {
            (Transport::Tcp(reqwest::Client::new()), host.to_string())
        };
        let base_url = Url::parse(&base_url)
            .map_err(|e| anyhow::anyhow!("Invalid DOCKER_HOST {}: {}", host, e))?;

        Ok(Self { transport, base_url, docker_bin: config.docker_bin.clone() })
    }

    fn unavailable(path: &str, status: Option<StatusCode>, reason: impl ToString) -> DsppError {
        DsppError::RemoteUnavailable {
            path: path.to_string(),
            status: status.map(|s| s.as_u16()),
            reason: reason.to_string(),
        }
    }

    /// Full URL of an API path with its query parameters encoded.
    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.join(path).map_err(|e| Self::unavailable(path, None, e))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        let url = self.url(path, query)?;
        debug!("{} {}", method, url);
        match &self.transport {
            Transport::Tcp(http) => {
                let mut request = http.request(method, url);
                if let Some(body) = body {
                    request = request.json(&body);
                }
                let response = request.send().await.map_err(|e| Self::unavailable(path, None, e))?;
                let status = response.status();
                let text = response.text().await.map_err(|e| Self::unavailable(path, Some(status), e))?;
                Ok((status, text))
            }
            Transport::Unix(socket) => self.send_unix(socket, method, path, url, body).await,
        }
    }

    async fn send_unix(
        &self,
        socket: &std::path::Path,
        method: Method,
        path: &str,
        url: Url,
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        let socket = socket.to_path_buf();
        let connector = service_fn(move |_: Uri| {
            let socket = socket.clone();
            Box::pin(async move {
                let stream = UnixStream::connect(socket).await?;
                Ok::<_, std::io::Error>(SocketStream(TokioIo::new(stream)))
            })
        });
        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(connector);

        let payload = match &body {
            Some(body) => serde_json::to_vec(body).map_err(|e| Self::unavailable(path, None, e))?,
            None => Vec::new(),
        };
        let mut request = hyper::Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(HOST, "docker");
        if body.is_some() {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        let request = request
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Self::unavailable(path, None, e))?;

        let response = client.request(request).await.map_err(|e| Self::unavailable(path, None, e))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Self::unavailable(path, Some(status), e))?
            .to_bytes();
        Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Send and require a 2xx answer. `None` on 404.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let (status, text) = self.send(method, path, query, body).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::unavailable(path, Some(status), text.trim()));
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text).map(Some).map_err(|e| Self::unavailable(path, Some(status), e))
    }

    async fn inspect_config(&self, name: &str) -> Result<Option<ConfigObject>> {
        let path = format!("/configs/{}", name);
        let Some(body) = self.call(Method::GET, &path, &[], None).await? else { return Ok(None) };
        serde_json::from_value(body).map(Some).map_err(|e| Self::unavailable(&path, None, e))
    }
}

/// The engine's `filters` query parameter, as JSON.
fn filters_query(filter: &ConfigFilter) -> String {
    let mut labels = Vec::new();
    if let Some(ns) = &filter.namespace {
        labels.push(format!("{}={}", dspp_core::reconcile::STACK_NAMESPACE_LABEL, ns));
    }
    if let Some(label) = &filter.label {
        labels.push(label.clone());
    }
    let mut filters = serde_json::Map::new();
    if !labels.is_empty() {
        filters.insert("label".into(), json!(labels));
    }
    if let Some(name) = &filter.name {
        filters.insert("name".into(), json!([name]));
    }
    Value::Object(filters).to_string()
}

#[async_trait]
impl ControlPlane for DockerClient {
    async fn configs_list(&self, filter: &ConfigFilter) -> Result<Vec<RemoteConfig>> {
        let path = "/configs";
        let query = [("filters", filters_query(filter))];
        let body = self.call(Method::GET, path, &query, None).await?.unwrap_or(Value::Array(vec![]));
        let configs: Vec<ConfigObject> =
            serde_json::from_value(body).map_err(|e| Self::unavailable(path, None, e))?;

        // The name filter of the engine is a prefix match.
        Ok(configs
            .into_iter()
            .map(ConfigObject::into_remote)
            .filter(|c| filter.name.as_ref().map(|n| &c.name == n).unwrap_or(true))
            .collect())
    }

    async fn config_read(&self, name: &str) -> Result<Option<String>> {
        let config = self.inspect_config(name).await?;
        Ok(config.map(|c| String::from_utf8_lossy(&c.into_remote().data).into_owned()))
    }

    async fn config_write(
        &self,
        name: &str,
        body: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.inspect_config(name).await?.is_some() {
            self.call(Method::DELETE, &format!("/configs/{}", name), &[], None).await?;
        }
        let spec = json!({ "Name": name, "Labels": labels, "Data": STANDARD.encode(body) });
        self.call(Method::POST, "/configs/create", &[], Some(spec)).await?;
        Ok(())
    }

    async fn service_labels_read(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let path = format!("/services/{}", name);
        let Some(service) = self.call(Method::GET, &path, &[], None).await? else {
            return Ok(BTreeMap::new());
        };
        let labels = service.pointer("/Spec/Labels").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(labels).unwrap_or_default())
    }

    async fn service_label_write(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let path = format!("/services/{}", name);
        let service = self
            .call(Method::GET, &path, &[], None)
            .await?
            .ok_or_else(|| Self::unavailable(&path, Some(StatusCode::NOT_FOUND), "no such service"))?;

        let version = service.pointer("/Version/Index").and_then(Value::as_u64).unwrap_or(0);
        let mut spec = service.get("Spec").cloned().unwrap_or_else(|| json!({}));
        if let Some(spec) = spec.as_object_mut() {
            let labels = spec.entry("Labels").or_insert_with(|| json!({}));
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(key.to_string(), Value::from(value));
            }
        }

        let update = format!("/services/{}/update", name);
        self.call(Method::POST, &update, &[("version", version.to_string())], Some(spec)).await?;
        Ok(())
    }

    async fn request(&self, method: &str, path: &str) -> Result<RemoteResponse> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| Self::unavailable(path, None, e))?;
        let (status, body) = self.send(method, path, &[], None).await?;
        Ok(RemoteResponse { status: status.as_u16(), body })
    }

    async fn deploy(&self, compiled: &str, stack_name: &str) -> Result<()> {
        info!("Deploying stack {}", stack_name);
        let mut child = Command::new(&self.docker_bin)
            .args(["stack", "deploy", "--with-registry-auth", "--compose-file", "-", stack_name])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| DsppError::ExecFailed {
                name: self.docker_bin.clone(),
                status: "spawn".into(),
                stderr: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(compiled.as_bytes())
                .await
                .map_err(|e| DsppError::io(self.docker_bin.clone(), e))?;
        }
        let status = child.wait().await.map_err(|e| DsppError::io(self.docker_bin.clone(), e))?;
        if !status.success() {
            return Err(DsppError::ExecFailed {
                name: format!("{} stack deploy", self.docker_bin),
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    async fn version(&self) -> Result<Value> {
        Ok(self.call(Method::GET, "/version", &[], None).await?.unwrap_or(Value::Null))
    }
}
