//! quill: writing assistant orchestrator
//!
//! Usage:
//!   quill run <goal>                       - Plan a goal and execute it
//!   quill plan <goal>                      - Plan a goal without executing it
//!   quill resume <plan-id>                 - Continue a plan from its checkpoint
//!   quill plans                            - List checkpointed plans
//!   quill config export [file]             - Export tool servers and skills
//!   quill config import <file> [--policy]  - Import tool servers and skills
//!   quill memory <owner> [tags...]         - Show stored memory records

use std::sync::Arc;

use quill_core::{Config, LlmClient, Plan, PlanId, TaskStatus};
use quill_orchestrator::{ImportPolicy, Orchestrator, PortableConfig, RunReport, RunStatus};
use tracing_subscriber::EnvFilter;

/// Command to run
#[derive(Debug, PartialEq)]
enum Command {
    Run(String),
    Plan(String),
    Resume(String),
    Plans,
    Export(Option<String>),
    Import { file: String, policy: ImportPolicy },
    Memory { owner: String, tags: Vec<String> },
    Help,
    Version,
    Invalid(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args);

    match &command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("quill {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Invalid(reason) => {
            eprintln!("error: {}", reason);
            eprintln!();
            print_help();
            std::process::exit(2);
        }
        _ => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;
    tracing::info!(model = %config.llm.model, workspace = %config.workspace.id, "Starting quill");

    let llm = LlmClient::new(&config.llm).map_err(|e| anyhow::anyhow!("Failed to create LLM client: {}", e))?;
    let orchestrator = Orchestrator::bootstrap(&config, Arc::new(llm))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start orchestrator: {}", e))?;

    let result = execute(&orchestrator, command).await;
    orchestrator.shutdown().await;
    result
}

async fn execute(orchestrator: &Orchestrator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run(goal) => {
            let plan = orchestrator.create_plan(&goal).await?;
            print_plan(&plan);
            run_until_interrupted(orchestrator, &plan.id, false).await
        }
        Command::Plan(goal) => {
            let plan = orchestrator.create_plan(&goal).await?;
            print_plan(&plan);
            println!();
            println!("Run it with: quill resume {}", plan.id);
            Ok(())
        }
        Command::Resume(id) => run_until_interrupted(orchestrator, &PlanId::new(id), true).await,
        Command::Plans => {
            for id in orchestrator.list_plans() {
                match orchestrator.plan(&id).await {
                    Ok(plan) => {
                        let progress = plan.progress();
                        println!(
                            "{}  {}/{} done  {}",
                            id,
                            progress.completed,
                            progress.total(),
                            plan.goal
                        );
                    }
                    Err(e) => println!("{}  (unreadable: {})", id, e),
                }
            }
            Ok(())
        }
        Command::Export(file) => {
            let exported = orchestrator.export_config().await;
            match file {
                Some(path) => {
                    exported.save(&path).await?;
                    println!(
                        "Exported {} server(s) and {} skill(s) to {}",
                        exported.servers.len(),
                        exported.skills.len(),
                        path
                    );
                }
                None => println!("{}", exported.to_json()?),
            }
            Ok(())
        }
        Command::Import { file, policy } => {
            let document = PortableConfig::load(&file).await?;
            let report = orchestrator.import_config(&document, policy).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Memory { owner, tags } => {
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            let records = orchestrator.query_memory(&owner, &tags)?;
            if records.is_empty() {
                println!("No memory records for {}", owner);
            }
            for record in records {
                println!(
                    "[{}] {} {}  tags: {}",
                    record.kind.as_str(),
                    record.key,
                    record.value,
                    record.tags.join(", ")
                );
            }
            Ok(())
        }
        Command::Help | Command::Version | Command::Invalid(_) => Ok(()),
    }
}

/// Run a plan; Ctrl+C cancels it so it can be resumed later
async fn run_until_interrupted(orchestrator: &Orchestrator, plan_id: &PlanId, resume: bool) -> anyhow::Result<()> {
    let run = async {
        if resume {
            orchestrator.resume(plan_id).await
        } else {
            orchestrator.run(plan_id).await
        }
    };

    tokio::select! {
        report = run => {
            let report = report?;
            print_report(orchestrator, &report).await;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, cancelling plan");
            orchestrator.cancel(plan_id).await?;
            println!();
            println!("Cancelled. Resume with: quill resume {}", plan_id);
        }
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("Plan {}: {}", plan.id, plan.goal);
    if let Some(analysis) = &plan.analysis {
        println!("  {}", analysis);
    }
    for task in plan.active_tasks() {
        let deps: Vec<String> = task.dependencies.iter().map(|d| d.to_string()).collect();
        println!(
            "  #{} [{}] {} ({}){}",
            task.id,
            task.status,
            task.title,
            task.kind.as_str(),
            if deps.is_empty() {
                String::new()
            } else {
                format!(" after {}", deps.join(", "))
            }
        );
    }
}

async fn print_report(orchestrator: &Orchestrator, report: &RunReport) {
    let progress = &report.progress;
    println!();
    println!(
        "Plan {} {}: {}/{} task(s) completed",
        report.plan_id,
        match report.status {
            RunStatus::Completed => "completed",
            RunStatus::Blocked => "blocked",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Abandoned => "abandoned",
        },
        progress.completed,
        progress.total()
    );
    for (id, reason) in &report.failed {
        println!("  #{} failed: {}", id, reason);
    }

    if let Ok(plan) = orchestrator.plan(&report.plan_id).await {
        for task in plan.active_tasks().filter(|t| t.status == TaskStatus::Completed) {
            if let Some(path) = &task.result_path {
                println!("  #{} {} -> {}", task.id, task.title, path);
            }
        }
    }
    if report.status == RunStatus::Blocked && !report.failed.is_empty() {
        println!("Fix the failures and resume with: quill resume {}", report.plan_id);
    }
}

/// Parse command line arguments
fn parse_args(args: &[String]) -> Command {
    let Some(first) = args.first() else {
        return Command::Help;
    };
    let rest = &args[1..];

    match first.as_str() {
        "--help" | "-h" | "help" => Command::Help,
        "--version" | "-v" => Command::Version,
        "run" | "plan" => {
            let goal = rest.join(" ");
            if goal.trim().is_empty() {
                return Command::Invalid(format!("{} needs a goal", first));
            }
            if first == "run" {
                Command::Run(goal)
            } else {
                Command::Plan(goal)
            }
        }
        "resume" => match rest {
            [id] => Command::Resume(id.clone()),
            _ => Command::Invalid("resume needs exactly one plan id".into()),
        },
        "plans" => Command::Plans,
        "config" => parse_config_args(rest),
        "memory" => match rest.split_first() {
            Some((owner, tags)) => Command::Memory {
                owner: owner.clone(),
                tags: tags.to_vec(),
            },
            None => Command::Invalid("memory needs an owner".into()),
        },
        other => Command::Invalid(format!("unknown command: {}", other)),
    }
}

fn parse_config_args(args: &[String]) -> Command {
    match args.first().map(String::as_str) {
        Some("export") => match &args[1..] {
            [] => Command::Export(None),
            [file] => Command::Export(Some(file.clone())),
            _ => Command::Invalid("config export takes at most one file".into()),
        },
        Some("import") => {
            let mut file = None;
            let mut policy = ImportPolicy::default();
            let mut iter = args[1..].iter();
            while let Some(arg) = iter.next() {
                if let Some(value) = arg.strip_prefix("--policy=") {
                    match ImportPolicy::parse(value) {
                        Some(p) => policy = p,
                        None => return Command::Invalid(format!("unknown policy: {}", value)),
                    }
                } else if arg == "--policy" {
                    match iter.next().and_then(|v| ImportPolicy::parse(v)) {
                        Some(p) => policy = p,
                        None => return Command::Invalid("--policy needs overwrite, merge or skip".into()),
                    }
                } else if file.is_none() {
                    file = Some(arg.clone());
                } else {
                    return Command::Invalid(format!("unexpected argument: {}", arg));
                }
            }
            match file {
                Some(file) => Command::Import { file, policy },
                None => Command::Invalid("config import needs a file".into()),
            }
        }
        _ => Command::Invalid("config needs export or import".into()),
    }
}

/// Print help message
fn print_help() {
    println!("quill - writing assistant orchestrator");
    println!();
    println!("Usage:");
    println!("  quill run <goal>                  Plan a goal and execute it");
    println!("  quill plan <goal>                 Plan a goal without executing it");
    println!("  quill resume <plan-id>            Continue a plan from its checkpoint");
    println!("  quill plans                       List checkpointed plans");
    println!("  quill config export [file]        Export tool servers and skills (stdout without a file)");
    println!("  quill config import <file> [--policy overwrite|merge|skip]");
    println!("                                    Import tool servers and skills (default policy: merge)");
    println!("  quill memory <owner> [tags...]    Show memory records carrying all tags");
    println!("  quill --help                      Show this help message");
    println!("  quill --version                   Show version");
    println!();
    println!("Configuration is read from ./quill.toml when present, otherwise from the environment.");
    println!();
    println!("Environment Variables:");
    println!("  LLM_API_KEY          API key (required)");
    println!("  LLM_MODEL            Model name");
    println!("  LLM_PROVIDER         Provider: claude or openai (default: claude)");
    println!("  LLM_BASE_URL         Custom API endpoint");
    println!("  QUILL_WORKSPACE_ROOT Directory holding workspaces (default: data/workspace)");
    println!("  QUILL_WORKSPACE_ID   Workspace id (default: default)");
    println!("  QUILL_EXTERNALIZE_THRESHOLD  Characters above which content is stored externally");
    println!("  QUILL_DB_PATH        SQLite database for long-term memory");
    println!("  QUILL_SKILL_DIRS     Comma-separated skill package directories");
    println!("  MCP_ENABLED          Enable tool servers (default: true)");
    println!("  MCP_CONFIG_PATH      Path to the tool server config file");
    println!("  MCP_CONFIG           Tool server config as inline JSON");
    println!("  RUST_LOG             Log filter (default: info)");
}
