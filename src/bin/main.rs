use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use rmcp::model::JsonObject;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use task_harness::mcp_client::inspect_service;
use task_harness::scheduler::{ExecutionStatus, VerdictSummary};
use task_harness::{
    ConflictGroups, ExecutionReport, LaunchSpec, McpServiceManager, ProcessExecutor, RmcpConnector,
    RunConfiguration, RunLayout, ScalarTable, SchedulerConfig, TaskScheduler, TemplateVars, UnresolvedPolicy,
    WorkspacePaths, analyze_artifacts, call_tool_with_retry, load_conflict_groups,
};

#[derive(Parser)]
#[command(name = "task-harness")]
#[command(about = "Concurrent job harness with conflict locking and capability-service supervision")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in a tasks folder
    Run(RunArgs),
    /// Inspect and exercise capability-service specs
    Services {
        #[command(flatten)]
        opts: ServiceOpts,
        #[command(subcommand)]
        action: ServicesCommand,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Folder under `tasks/` holding one directory per task
    #[arg(long)]
    tasks_folder: String,
    /// Run tag; generated when omitted
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    model_short_name: String,
    #[arg(long)]
    provider: String,
    #[arg(long)]
    maxstep: String,
    #[arg(long, default_value_t = 100)]
    workers: usize,
    /// Per-job timeout in seconds
    #[arg(long, default_value_t = 1800)]
    timeout: u64,
    /// Defaults to `tasks/<folder>/task_conflict.json`
    #[arg(long)]
    conflict_file: Option<PathBuf>,
    /// Command used to start one job
    #[arg(long, default_value = ProcessExecutor::default_launcher())]
    launcher: String,
    /// Seconds between progress reports
    #[arg(long, default_value_t = 30)]
    progress_interval: u64,
    /// Directory holding `tasks/`, `logs_containers/`, `dumps/` and `results/`
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[derive(Args)]
struct ServiceOpts {
    #[arg(long, env = "HARNESS_SERVICES_DIR", default_value = "configs/mcp_servers")]
    services_dir: PathBuf,
    /// Agent workspace substituted for `${agent_workspace}`
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Global `config.*` table (YAML or JSON)
    #[arg(long, env = "HARNESS_CONFIG")]
    config_file: Option<PathBuf>,
    /// Global `token.*` table (YAML or JSON)
    #[arg(long, env = "HARNESS_SECRETS")]
    secrets_file: Option<PathBuf>,
    /// Per-job `token.*` overrides
    #[arg(long)]
    job_secrets_file: Option<PathBuf>,
    /// Value for `${podman_or_docker}`
    #[arg(long)]
    container_runtime: Option<String>,
    /// Fail on unresolved placeholders instead of leaving them verbatim
    #[arg(long, default_value_t = false)]
    strict: bool,
}

#[derive(Subcommand)]
enum ServicesCommand {
    /// List declared services
    List,
    /// Print the template variable table (secrets masked)
    Vars,
    /// Connect, list tools, optionally call one, then disconnect
    Check {
        /// Services to check; all when omitted
        names: Vec<String>,
        /// Tool to call on every checked service that exposes it
        #[arg(long)]
        call: Option<String>,
        /// JSON object passed as tool arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("task_harness=info".parse()?)
                .add_directive("rmcp=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_batch(args).await?,
        Commands::Services { opts, action } => {
            let manager = build_manager(&opts)?;
            match action {
                ServicesCommand::List => {
                    let names = manager.available();
                    println!("{} services in {}:", names.len(), opts.services_dir.display());
                    for name in names {
                        if let Some(spec) = manager.spec(&name) {
                            println!("  {:<24} {:?}  cache_tools_list={}", name, spec.kind(), spec.cache_tools_list);
                        }
                    }
                }
                ServicesCommand::Vars => {
                    for (key, value) in manager.template_variables().iter() {
                        let shown = if key.starts_with("token.") { "***" } else { value.as_str() };
                        println!("{key} = {shown}");
                    }
                }
                ServicesCommand::Check { names, call, args } => {
                    let args: JsonObject = serde_json::from_str(&args).context("--args must be a JSON object")?;
                    check_services(&manager, names, call, args).await?;
                }
            }
        }
    }

    Ok(())
}

fn build_manager(opts: &ServiceOpts) -> Result<McpServiceManager> {
    let cwd = std::env::current_dir()?;
    let workspace = WorkspacePaths::new(opts.workspace.clone().unwrap_or_else(|| cwd.clone()), &cwd);
    let config = ScalarTable::load_optional(opts.config_file.as_deref())?;
    let secrets = ScalarTable::load_optional(opts.secrets_file.as_deref())?;
    let job_secrets = match &opts.job_secrets_file {
        Some(path) => Some(ScalarTable::load(path)?),
        None => None,
    };
    let policy = if opts.strict { UnresolvedPolicy::Deny } else { UnresolvedPolicy::Warn };
    let vars = TemplateVars::build(
        &workspace,
        opts.container_runtime.as_deref(),
        &config,
        &secrets,
        job_secrets.as_ref(),
    )
    .with_policy(policy);

    Ok(McpServiceManager::from_dir(&opts.services_dir, vars, RmcpConnector)?)
}

async fn check_services(
    manager: &McpServiceManager,
    names: Vec<String>,
    call: Option<String>,
    args: JsonObject,
) -> Result<()> {
    let summary = if names.is_empty() {
        manager.connect_all().await
    } else {
        manager.connect(&names).await
    };

    for name in &summary.connected {
        let Some(svc) = manager.get_connected(name) else {
            continue;
        };
        match inspect_service(&svc).await {
            Ok((info, tools)) => {
                println!("✓ {name}: {} ({} tools)", info.server_info.name, tools.len());
                for tool in &tools {
                    println!("    - {}", tool.name);
                }
                if let Some(tool) = call.as_deref().filter(|t| tools.iter().any(|x| x.name == *t)) {
                    match call_tool_with_retry(&svc, tool, args.clone(), 5, Duration::from_secs(1)).await {
                        Ok(content) => println!("    {tool} returned {} content item(s)", content.len()),
                        Err(e) => println!("    {e}"),
                    }
                }
            }
            Err(e) => println!("? {name}: connected but listing failed: {e}"),
        }
    }
    for name in &summary.failed {
        println!("✗ {name}: {}", manager.state(name));
    }
    for name in &summary.unknown {
        println!("? {name}: no such service");
    }

    manager.ensure_all_disconnected().await;

    if summary.failed.is_empty() && summary.unknown.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "{} service(s) failed to connect, {} unknown",
            summary.failed.len(),
            summary.unknown.len()
        ))
    }
}

async fn run_batch(args: RunArgs) -> Result<()> {
    let tag = args.tag.clone().unwrap_or_else(RunLayout::generate_tag);
    let layout = Arc::new(RunLayout::new(&args.root, &args.tasks_folder, &args.model_short_name, &tag));
    info!(tasks_folder = %args.tasks_folder, tag = %tag, model = %args.model_short_name, "preparing run");

    let jobs = layout.discover_jobs()?;
    let conflict_file = args.conflict_file.clone().unwrap_or_else(|| layout.default_conflict_file());
    let groups = ConflictGroups::new(load_conflict_groups(&conflict_file)?);

    let executor = ProcessExecutor::new(
        LaunchSpec::parse(&args.launcher)?,
        layout.clone(),
        &args.provider,
        &args.maxstep,
    );
    let scheduler = TaskScheduler::new(
        executor,
        groups,
        SchedulerConfig {
            worker_count: args.workers,
            per_job_timeout: Duration::from_secs(args.timeout),
            progress_interval: Duration::from_secs(args.progress_interval),
        },
    );

    println!("Running {} tasks with {} workers (tag {tag})\n", jobs.len(), args.workers);
    let outcomes = scheduler.run(jobs.clone()).await;

    let rule = "=".repeat(60);
    println!("\n{rule}\nEXECUTION COMPLETE!\n{}", scheduler.progress());
    let unsuccessful: Vec<_> = outcomes
        .values()
        .filter(|o| o.status != ExecutionStatus::Success)
        .collect();
    if !unsuccessful.is_empty() {
        println!("\nExecution Failed Tasks ({}):", unsuccessful.len());
        for o in unsuccessful {
            println!("  - {}: {:?} - {}", o.job_id, o.status, o.error.as_deref().unwrap_or("N/A"));
        }
    }

    let verdicts = analyze_artifacts(&layout, &jobs);
    let report = ExecutionReport::build(
        RunConfiguration {
            tasks_folder: args.tasks_folder.clone(),
            model_short_name: args.model_short_name.clone(),
            provider: args.provider.clone(),
            maxstep: args.maxstep.clone(),
            workers: args.workers,
            timeout: args.timeout,
            tag: tag.clone(),
        },
        &verdicts,
    );
    print_results(&report, &verdicts);

    let report_path = layout.report_path();
    match report.write(&report_path) {
        Ok(()) => println!("\nDetailed report saved to: {}", report_path.display()),
        Err(e) => warn!(error = %e, "could not save report file"),
    }
    Ok(())
}

fn print_results(report: &ExecutionReport, verdicts: &VerdictSummary) {
    let s = &report.summary;
    println!("\nFINAL RESULTS SUMMARY");
    println!("  Total tasks:     {}", s.total_tasks);
    println!("  ✓ Passed:        {}", s.passed);
    println!("  ✗ Failed:        {}", s.failed);
    println!("  ⚠ Not executed:  {}", s.not_executed);
    println!("  ? Error/Invalid: {}", s.error);

    let pct = |p: Option<f64>| p.map(|v| format!(" = {v:.2}%")).unwrap_or_default();
    println!("  Pass rate (true/all):           {}{}", s.pass_rate_all, pct(s.pass_rate_all_percent));
    println!(
        "  Pass rate (true/(true+false)):  {}{}",
        s.pass_rate_executed,
        pct(s.pass_rate_executed_percent)
    );

    for (label, list) in [("Not Executed", &verdicts.not_executed), ("Error/Invalid", &verdicts.invalid)] {
        if list.is_empty() {
            continue;
        }
        println!("\n{label} Tasks ({}):", list.len());
        for id in list.iter().take(10) {
            println!("    - {id}");
        }
        if list.len() > 10 {
            println!("    ... and {} more", list.len() - 10);
        }
    }
    if !verdicts.failed.is_empty() && verdicts.failed.len() <= 20 {
        println!("\nFailed Tasks ({}):", verdicts.failed.len());
        for id in &verdicts.failed {
            println!("    - {id}");
        }
    }
}
