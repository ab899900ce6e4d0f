use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use maestro::agent::{AgentPool, EchoAgent};
use maestro::config::Config;
use maestro::context::Strategy;
use maestro::core::{TaskFile, TaskGraph};
use maestro::orchestration::{FirstReadyManager, Process, ProcessMode};
use maestro::{mlog, mlog_error, Result};

/// Maestro - multi-agent task orchestration
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.maestro/maestro.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a task file and print its execution order
    Validate {
        /// Task file (.toml or .json)
        tasks: PathBuf,
    },

    /// Print the usable and history budgets of the configured allocation
    Budget,

    /// Run a task file against offline echo agents and print the JSON report
    Run {
        /// Task file (.toml or .json)
        tasks: PathBuf,

        /// Dispatch mode (sequential, hierarchical, workflow)
        #[arg(long, short = 'm')]
        mode: Option<ProcessMode>,

        /// Compaction strategy (truncate, sliding_window, summarize, prune_tools, smart)
        #[arg(long, short = 's')]
        strategy: Option<Strategy>,

        /// Input handed to every task as context
        #[arg(long, short = 'i')]
        input: Option<String>,

        /// Ready tasks dispatched together in workflow mode
        #[arg(long)]
        concurrency: Option<usize>,

        /// Re-run a task under the [repeat] settings until its output
        /// contains the --until text (repeatable)
        #[arg(long = "loop", value_name = "TASK", requires = "until")]
        loops: Vec<String>,

        /// Text a looped task's output must contain to complete
        #[arg(long, value_name = "TEXT")]
        until: Option<String>,
    },

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    maestro::log::init_with_debug(cli.debug);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    let result = match cli.command {
        Command::Validate { tasks } => run_validate(&tasks),
        Command::Budget => run_budget(&config_path),
        Command::Run {
            tasks,
            mode,
            strategy,
            input,
            concurrency,
            loops,
            until,
        } => run_tasks(
            &config_path,
            &tasks,
            RunOptions {
                mode,
                strategy,
                input,
                concurrency,
                loops,
                until,
            },
        ),
        Command::Init { force } => run_init(&config_path, force),
    };

    if let Err(e) = &result {
        mlog_error!("Command failed: {}", e);
    }
    result
}

fn load_graph(path: &Path) -> Result<TaskGraph> {
    let file = TaskFile::from_path(path)?;
    mlog!("Loaded {} tasks from {}", file.tasks.len(), path.display());
    TaskGraph::build(file.tasks)
}

/// Print declaration order, dependency waves and a topological order.
fn run_validate(tasks: &Path) -> Result<()> {
    mlog!("Validate command: tasks={}", tasks.display());
    let graph = load_graph(tasks)?;

    println!("{} tasks, {} dependencies", graph.len(), graph.dependency_count());
    println!();
    println!("Declaration order:");
    for task in graph.tasks() {
        if task.context_tasks.is_empty() {
            println!("  {} ({})", task.id, task.agent_id);
        } else {
            let deps: Vec<&str> = task.context_tasks.iter().map(|d| d.as_str()).collect();
            println!("  {} ({}) <- {}", task.id, task.agent_id, deps.join(", "));
        }
    }

    println!();
    println!("Waves:");
    for (i, wave) in graph.waves().iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("  {}: {}", i, ids.join(", "));
    }

    let order: Vec<&str> = graph
        .topological_order()?
        .into_iter()
        .map(|t| t.id.as_str())
        .collect();
    println!();
    println!("Topological order: {}", order.join(" -> "));
    Ok(())
}

fn run_budget(config_path: &Path) -> Result<()> {
    mlog!("Budget command: config={}", config_path.display());
    let config = Config::load_from(config_path)?;
    let budget = &config.budget;

    println!("Model limit:     {}", budget.model_limit);
    println!("Output reserve:  {}", budget.output_reserve);
    println!("Usable budget:   {}", budget.usable_budget());
    println!("Fixed segments:  {}", budget.fixed_total());

    budget.validate()?;
    let threshold = config.process.threshold();
    println!("History budget:  {}", budget.history_budget());
    println!(
        "Compaction at:   {} tokens ({:.0}% of usable)",
        budget.trigger_tokens(threshold),
        threshold * 100.0
    );
    Ok(())
}

/// Command-line overrides for `maestro run`.
struct RunOptions {
    mode: Option<ProcessMode>,
    strategy: Option<Strategy>,
    input: Option<String>,
    concurrency: Option<usize>,
    loops: Vec<String>,
    until: Option<String>,
}

fn run_tasks(config_path: &Path, tasks: &Path, options: RunOptions) -> Result<()> {
    let mut config = Config::load_from(config_path)?;
    if let Some(mode) = options.mode {
        config.process.mode = mode;
    }
    if let Some(strategy) = options.strategy {
        config.process.strategy = strategy;
    }
    if let Some(n) = options.concurrency {
        config.process.max_concurrency = n;
    }
    config.validate()?;
    mlog!(
        "Run command: tasks={}, mode={}, strategy={}",
        tasks.display(),
        config.process.mode,
        config.process.strategy
    );

    let mut graph = load_graph(tasks)?;
    let mut agents = AgentPool::new();
    for task in graph.tasks() {
        if !agents.contains(&task.agent_id) {
            let agent = EchoAgent::new(task.agent_id.as_str());
            agents = agents.with_agent(task.agent_id.clone(), agent);
        }
    }

    let mut process =
        Process::new(config.process.clone(), config.budget.clone())?.with_manager(FirstReadyManager);
    if let Some(until) = options.until {
        for task in options.loops {
            let needle = until.clone();
            let repeat = config
                .repeat_loop()
                .until_fn(move |ctx| ctx.last_output.contains(&needle));
            process = process.with_loop(task, repeat);
        }
    }
    let token = process.cancellation_token();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mlog!("Interrupt received, cancelling after the current task");
                token.cancel();
            }
        });
        let report = run_process(&process, &mut graph, &agents, options.input.as_deref()).await;
        watcher.abort();
        report
    })?;

    println!("{}", report.to_json()?);
    Ok(())
}

async fn run_process(
    process: &Process,
    graph: &mut TaskGraph,
    agents: &AgentPool,
    input: Option<&str>,
) -> Result<maestro::RunReport> {
    match input {
        Some(input) => process.run_with_input(graph, agents, input).await,
        None => process.run(graph, agents).await,
    }
}

fn run_init(config_path: &Path, force: bool) -> Result<()> {
    mlog!("Init command: path={}, force={}", config_path.display(), force);
    if config_path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
        return Ok(());
    }
    Config::default().save_to(config_path)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}
