// Core modules
pub mod concurrency;
pub mod config;
pub mod llm_client;
pub mod mcp_client;
pub mod scheduler;
pub mod services;
pub mod template;

// Re-export key types and functions
pub use config::{ConfigError, ScalarTable, ServiceSpec, TransportKind, load_conflict_groups, load_service_specs};
pub use mcp_client::{RmcpConnector, RunningService, ToolCallError, call_tool_with_retry};
pub use scheduler::{
    ConflictGroups, ExecutionReport, ExecutionStatus, JobDescriptor, JobExecutor, JobOutcome, LaunchSpec,
    ProcessExecutor, RunConfiguration, RunLayout, SchedulerConfig, TaskScheduler, analyze_artifacts,
};
pub use services::{ConnectSummary, ConnectionState, LifecycleOptions, ServiceConnector, ServiceManager};
pub use template::{TemplateError, TemplateVars, UnresolvedPolicy, WorkspacePaths};

/// Connection manager backed by real rmcp sessions.
pub type McpServiceManager = ServiceManager<RmcpConnector>;
