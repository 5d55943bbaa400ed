// Capability-service client backed by rmcp

use std::borrow::Cow;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{NetworkParams, ServiceParams, ServiceSpec, StdioParams};
use crate::services::ServiceConnector;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Content, JsonObject};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{
    ServiceExt,
    model::{ServerInfo, Tool as McpTool},
    service::{RoleClient, RunningService as RmcpRunningService},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
#[error("tool call `{tool}` failed after {attempts} attempts: {last}")]
pub struct ToolCallError {
    pub tool: String,
    pub attempts: u32,
    pub last: String,
}

/// A live rmcp client session for one capability service.
pub struct RunningService {
    pub name: String,
    pub client: RmcpRunningService<RoleClient, ()>,
    cache_tools: bool,
    tools: OnceCell<Vec<McpTool>>,
}

impl RunningService {
    fn new(spec: &ServiceSpec, client: RmcpRunningService<RoleClient, ()>) -> Self {
        Self {
            name: spec.name.clone(),
            client,
            cache_tools: spec.cache_tools_list,
            tools: OnceCell::new(),
        }
    }

    /// List tools, reusing the first listing when the spec allows caching.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        if !self.cache_tools {
            return Ok(self.client.list_tools(Default::default()).await?.tools);
        }
        let tools = self
            .tools
            .get_or_try_init(|| async {
                anyhow::Ok(self.client.list_tools(Default::default()).await?.tools)
            })
            .await?;
        Ok(tools.clone())
    }
}

async fn start_stdio_service(name: &str, params: &StdioParams) -> Result<RmcpRunningService<RoleClient, ()>> {
    info!("Starting stdio service `{name}` via rmcp");

    let mut cmd = Command::new(&params.command);
    if !params.args.is_empty() {
        cmd.args(params.args.iter());
    }
    if !params.env.is_empty() {
        cmd.envs(params.env.iter().map(|(k, v)| (k, v)));
    }

    let child = TokioChildProcess::new(cmd.configure(|cmd| {
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
    }))?;

    Ok(().serve(child).await?)
}

async fn start_network_service(name: &str, params: &NetworkParams) -> Result<RmcpRunningService<RoleClient, ()>> {
    info!("Starting network service `{name}` at `{}` via rmcp streamable HTTP", params.url);
    if !params.headers.is_empty() {
        warn!(service = name, "custom headers are not forwarded by the streamable HTTP transport");
    }

    let transport = StreamableHttpClientTransport::from_uri(params.url.as_str());
    Ok(().serve(transport).await?)
}

/// Open a session, bounded by the spec's session timeout when it has one.
pub async fn start_service(spec: &ServiceSpec) -> Result<RunningService> {
    let open = async {
        match &spec.params {
            ServiceParams::Stdio(p) => start_stdio_service(&spec.name, p).await,
            ServiceParams::Network(p) => start_network_service(&spec.name, p).await,
        }
    };
    let client = match spec.session_timeout {
        Some(limit) => tokio::time::timeout(limit, open)
            .await
            .map_err(|_| anyhow!("service `{}` did not initialize within {:?}", spec.name, limit))??,
        None => open.await?,
    };
    Ok(RunningService::new(spec, client))
}

/// Close a session. If other holders still share it, its cancellation
/// token is fired instead and the transport winds down on its own.
pub async fn stop_service(running: Arc<RunningService>) -> Result<()> {
    match Arc::try_unwrap(running) {
        Ok(svc) => {
            svc.client.cancel().await?;
        }
        Err(shared) => {
            warn!(service = %shared.name, "session still shared at close, cancelling");
            shared.client.cancellation_token().cancel();
        }
    }
    Ok(())
}

/// Fetch service info + tools.
pub async fn inspect_service(running: &RunningService) -> Result<(ServerInfo, Vec<McpTool>)> {
    let server_info = running.client.peer_info().cloned().unwrap_or_default();
    let tools = running.list_tools().await?;

    if tools.is_empty() {
        warn!("Service `{}` reported no tools", running.name);
    }

    Ok((server_info, tools))
}

pub async fn call_tool(running: &RunningService, tool_name: &str, args: JsonObject) -> Result<Vec<Content>> {
    let request = CallToolRequestParam {
        name: Cow::from(tool_name.to_string()),
        arguments: Some(args),
        meta: None,
        task: None,
    };

    let resp = running.client.call_tool(request).await?;
    Ok(resp.content)
}

/// Call a tool, retrying up to `retries` extra times with a fixed `delay`.
pub async fn call_tool_with_retry(
    running: &RunningService,
    tool_name: &str,
    args: JsonObject,
    retries: u32,
    delay: Duration,
) -> Result<Vec<Content>, ToolCallError> {
    retry_fixed(tool_name, retries, delay, || call_tool(running, tool_name, args.clone())).await
}

async fn retry_fixed<T, E, F, Fut>(tool: &str, retries: u32, delay: Duration, mut op: F) -> Result<T, ToolCallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < retries => {
                warn!(tool, attempt = attempt + 1, total = retries + 1, error = %e, "tool call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(ToolCallError {
                    tool: tool.to_string(),
                    attempts: attempt + 1,
                    last: e.to_string(),
                });
            }
        }
    }
}

/// Opens real capability services through rmcp.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmcpConnector;

#[async_trait]
impl ServiceConnector for RmcpConnector {
    type Connection = RunningService;

    async fn open(&self, spec: &ServiceSpec) -> Result<RunningService> {
        start_service(spec).await
    }

    async fn close(&self, connection: Arc<RunningService>) -> Result<()> {
        stop_service(connection).await
    }
}
