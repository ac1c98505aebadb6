// Run command: submit a command to a fresh engine and report the outcome

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use stagehand_exec::{Engine, ExecError, ExecOptions, PoolStats, ShutdownReport, TaskOutput};
use tokio::task::JoinSet;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};
use crate::EngineArgs;

pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub repeat: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Completed(TaskOutput),
    Failed { error: String },
}

#[derive(Debug, Serialize)]
struct RunResult {
    run: u32,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Debug, Serialize)]
struct RunReport {
    results: Vec<RunResult>,
    stats: PoolStats,
    shutdown: ShutdownReport,
}

pub async fn run(engine_args: &EngineArgs, request: RunRequest, output: OutputFormat) -> Result<()> {
    let config = engine_args.resolve()?;
    let engine = Engine::new(config).context("Failed to start execution engine")?;

    let mut options = ExecOptions::new();
    if let Some(dir) = request.cwd {
        options = options.with_working_directory(dir);
    }
    if let Some(ms) = request.timeout_ms {
        options = options.with_timeout_ms(ms);
    }

    let mut results = Vec::with_capacity(request.repeat as usize);
    let mut pending = JoinSet::new();
    for run in 1..=request.repeat {
        match engine.submit(&request.command, &request.args, options.clone()) {
            Ok(task) => {
                pending.spawn(async move { (run, task.wait().await) });
            }
            Err(e) => results.push((run, Err(e))),
        }
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = pending.join_next() => match joined {
                Some(joined) => results.push(joined.context("Task waiter panicked")?),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::warn!("Interrupted, killing running processes");
                engine.force_kill_all();
            }
        }
    }
    results.sort_by_key(|(run, _)| *run);

    let stats = engine.stats();
    let shutdown = engine.shutdown(engine_args.shutdown_grace()).await;

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    let report = RunReport {
        results: results
            .into_iter()
            .map(|(run, result)| RunResult {
                run,
                outcome: outcome(result),
            })
            .collect(),
        stats,
        shutdown,
    };

    if output.is_text() {
        print_text(&report);
    } else {
        output.print_value(&report)?;
    }

    if interrupted {
        bail!("interrupted");
    }
    if failed > 0 {
        bail!("{} of {} runs failed", failed, request.repeat);
    }
    Ok(())
}

fn outcome(result: Result<TaskOutput, ExecError>) -> Outcome {
    match result {
        Ok(output) => Outcome::Completed(output),
        Err(e) => Outcome::Failed {
            error: e.to_string(),
        },
    }
}

fn print_text(report: &RunReport) {
    if let [single] = report.results.as_slice() {
        match &single.outcome {
            Outcome::Completed(output) => {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                print_field("Exit code", &output.exit_code.to_string());
                print_field(
                    "Duration",
                    &format!("{}ms", output.duration.as_millis()),
                );
            }
            Outcome::Failed { error } => print_field("Error", error),
        }
    } else {
        print_table_header(&[("RUN", 5), ("STATUS", 10), ("EXIT", 6), ("DETAIL", 48)]);
        for result in &report.results {
            let run = result.run.to_string();
            match &result.outcome {
                Outcome::Completed(output) => {
                    let exit = output.exit_code.to_string();
                    let detail = format!("{}ms", output.duration.as_millis());
                    print_table_row(&[(&run, 5), ("completed", 10), (&exit, 6), (&detail, 48)]);
                }
                Outcome::Failed { error } => {
                    print_table_row(&[(&run, 5), ("failed", 10), ("-", 6), (error, 48)]);
                }
            }
        }
    }

    println!();
    let stats = &report.stats;
    print_field(
        "Workers",
        &format!("{} ({} busy)", stats.total_workers, stats.busy_workers),
    );
    print_field("Completed", &stats.completed_tasks.to_string());
    print_field("Failed", &stats.failed_tasks.to_string());
    print_field(
        "Avg duration",
        &format!("{:.1}ms", stats.average_duration_ms),
    );
    if !report.shutdown.drained {
        print_field(
            "Force killed",
            &report.shutdown.force_killed.to_string(),
        );
    }
}
