//! `opsdeck`: command-line client for the OpsDeck server

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use opsdeck_client::api::{HttpProcessApi, ProcessApi};
use opsdeck_client::reconcile::DEFAULT_RECONCILE_INTERVAL;
use opsdeck_client::state::DEFAULT_MAX_LINES;
use opsdeck_client::types::{process_topic, OutputStream};
use opsdeck_client::{EventStream, ProcessController, ProcessState, ProcessTracker, Reconciler};

#[derive(Parser)]
#[command(name = "opsdeck", version, about = "Run and watch OpsDeck processes")]
struct Cli {
    /// Server base URL
    #[arg(long, env = "OPSDECK_SERVER", default_value = "http://127.0.0.1:4680")]
    server: String,

    /// Seconds between status reconciliations while following a process
    #[arg(long, default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs())]
    reconcile_secs: u64,

    /// Output lines kept in memory while following a process
    #[arg(long, default_value_t = DEFAULT_MAX_LINES)]
    max_lines: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a command and stream its output until it exits
    Run {
        #[arg(long)]
        cwd: Option<String>,
        /// Shell command line
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Follow the output of an already running process
    Attach,
    /// Print the status of a process
    Status { id: String },
    /// Kill a running process
    Kill { id: String },
    /// List running processes
    List,
    /// Print aggregated stream events as JSON lines
    Watch {
        #[arg(long)]
        project: Option<String>,
        /// Comma-separated topics, e.g. `tickets,progress,process:<id>`
        #[arg(long, default_value = "tickets,progress")]
        topics: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout carries only process output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::WARN.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let api = Arc::new(HttpProcessApi::new(cli.server.clone())?);

    match cli.command {
        Command::Run { cwd, command } => {
            let tracker = Arc::new(ProcessTracker::new().with_max_lines(cli.max_lines));
            let controller = ProcessController::new(api.clone(), tracker.clone());
            let handle = controller.start(&command.join(" "), cwd).await?;
            eprintln!("started {} (pid {})", handle.id, handle.pid);
            let code = follow(&cli.server, cli.reconcile_secs, api, controller, &handle.id).await?;
            std::process::exit(code.unwrap_or(1));
        }
        Command::Attach => {
            let tracker = Arc::new(ProcessTracker::new().with_max_lines(cli.max_lines));
            let controller = ProcessController::new(api.clone(), tracker.clone());
            let Some(handle) = controller.attach_running().await? else {
                anyhow::bail!("no running process");
            };
            eprintln!("attached to {} (pid {})", handle.id, handle.pid);
            let code = follow(&cli.server, cli.reconcile_secs, api, controller, &handle.id).await?;
            std::process::exit(code.unwrap_or(1));
        }
        Command::Status { id } => {
            let status = api.status(&id).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Kill { id } => {
            api.kill(&id).await?;
            eprintln!("killed {}", id);
        }
        Command::List => {
            for handle in api.list().await? {
                println!("{}\t{}", handle.id, handle.pid);
            }
        }
        Command::Watch { project, topics } => {
            let topics = topics.split(',').map(|t| t.trim().to_string()).collect();
            let mut stream = EventStream::new(cli.server, topics);
            if let Some(project) = project {
                stream = stream.with_project(project);
            }
            let (mut events, _task) = stream.spawn();
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}

/// Stream a tracked process to stdout/stderr until it completes
async fn follow(
    server: &str,
    reconcile_secs: u64,
    api: Arc<HttpProcessApi>,
    controller: ProcessController,
    id: &str,
) -> anyhow::Result<Option<i32>> {
    let tracker = controller.tracker().clone();

    let reconciler = Reconciler::new(api, tracker.clone())
        .with_interval(Duration::from_secs(reconcile_secs.max(1)))
        .spawn();

    let printer = tokio::spawn({
        let mut state = tracker.subscribe();
        async move {
            let mut printed = 0u64;
            loop {
                let current = state.borrow_and_update().clone();
                for line in current.lines() {
                    if line.seq <= printed {
                        continue;
                    }
                    match line.stream {
                        OutputStream::Stdout => println!("{}", line.line),
                        OutputStream::Stderr => eprintln!("{}", line.line),
                    }
                    printed = line.seq;
                }
                if matches!(*current, ProcessState::Completed { .. }) || state.changed().await.is_err() {
                    break;
                }
            }
        }
    });

    let (events, stream_task) = EventStream::new(server, vec![process_topic(id)]).spawn();
    let code = controller.follow(ReceiverStream::new(events)).await?;

    let _ = printer.await;
    reconciler.abort();
    stream_task.abort();
    Ok(code)
}
