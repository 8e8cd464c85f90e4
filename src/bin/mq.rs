use std::path::PathBuf;

use clap::{Parser, Subcommand};

use myqueue::config::{default_socket_path, parse_id_list, Config};
use myqueue::error::{QueueError, Result};
use myqueue::executor::join_ids;
use myqueue::ipc::protocol::{QueueView, TaskView};
use myqueue::ipc::{IpcClient, Request, Response};
use myqueue::resources::ResourceLedger;
use myqueue::store::{parse_id_range, parse_workdirs_file};
use myqueue::task::SubmitRequest;

#[derive(Parser, Debug)]
#[command(name = "mq")]
#[command(about = "Submit and manage jobs on the myqueue daemon", version)]
struct Cli {
    /// Daemon socket (default: /tmp/myqueue_<user>.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a script to the queue
    Submit {
        script: PathBuf,
        /// CPU cores to request
        #[arg(long, default_value = "1")]
        ncpu: usize,
        /// GPU devices to request
        #[arg(long, default_value = "1")]
        ngpu: usize,
        /// Specific CPU cores, comma-separated (overrides --ncpu)
        #[arg(long)]
        cpus: Option<String>,
        /// Specific GPU devices, comma-separated (overrides --ngpu)
        #[arg(long)]
        gpus: Option<String>,
        /// Working directory (default: current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        /// File listing one working directory per line; submits one
        /// task per directory
        #[arg(long)]
        workdirs: Option<PathBuf>,
        /// Per-job log file name, relative to the working directory
        #[arg(long)]
        logfile: Option<String>,
    },
    /// Show the queue
    Queue {
        /// Include completed, failed and cancelled tasks
        #[arg(long)]
        all: bool,
        /// Print only the summary line
        #[arg(short, long)]
        summary: bool,
    },
    /// Delete tasks: a single id, a range "A-B", or "all"
    Delete { target: String },
    /// Show full details of one task
    Info { id: u64 },
    /// Show a task's log output
    Log {
        id: u64,
        /// Show only the last N lines
        #[arg(short = 'n', long, default_value = "0")]
        tail: usize,
    },
    /// Show current CPU/GPU status as measured on this host
    Resources,
    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let socket = cli.socket.unwrap_or_else(default_socket_path);

    match cli.command {
        Command::Submit {
            script,
            ncpu,
            ngpu,
            cpus,
            gpus,
            workdir,
            workdirs,
            logfile,
        } => {
            let script = script.canonicalize()?;
            let specific_cpus = cpus.as_deref().map(parse_id_list).unwrap_or_default();
            let specific_gpus = gpus.as_deref().map(parse_id_list).unwrap_or_default();
            let log_file = logfile.unwrap_or_default();

            let targets: Vec<PathBuf> = match workdirs {
                Some(file) => {
                    let (valid, invalid) = parse_workdirs_file(&file);
                    for dir in &invalid {
                        eprintln!("skipping missing directory: {dir}");
                    }
                    if valid.is_empty() {
                        return Err(QueueError::Protocol(format!(
                            "no usable directories in {}",
                            file.display()
                        )));
                    }
                    valid
                }
                None => {
                    let dir = match workdir {
                        Some(dir) => dir,
                        None => std::env::current_dir()?,
                    };
                    vec![dir.canonicalize()?]
                }
            };

            let mut client = IpcClient::connect(&socket).await?;
            for target in targets {
                let request = Request::Submit(SubmitRequest {
                    script_path: script.clone(),
                    workdir: target.clone(),
                    ncpu,
                    ngpu,
                    specific_cpus: specific_cpus.clone(),
                    specific_gpus: specific_gpus.clone(),
                    log_file: log_file.clone(),
                });
                match client.request(&request).await? {
                    Response::Submitted { task_id } => {
                        println!("Submitted task {task_id} ({})", target.display());
                    }
                    other => print_unexpected(&other),
                }
            }
        }

        Command::Queue { all, summary } => {
            let mut client = IpcClient::connect(&socket).await?;
            match client
                .request(&Request::Query {
                    include_terminal: all,
                })
                .await?
            {
                Response::Queue(view) => print_queue(&view, all, summary),
                other => print_unexpected(&other),
            }
        }

        Command::Delete { target } => {
            let mut client = IpcClient::connect(&socket).await?;
            if target == "all" {
                match client.request(&Request::DeleteAll).await? {
                    Response::DeletedAll(summary) => {
                        println!(
                            "Deleted {} task(s): {} terminated, {} pending, {} finished",
                            summary.total,
                            summary.running_terminated,
                            summary.pending_deleted,
                            summary.terminal_deleted
                        );
                    }
                    other => print_unexpected(&other),
                }
            } else {
                let task_ids = parse_id_range(&target);
                if task_ids.is_empty() {
                    return Err(QueueError::Protocol(format!(
                        "invalid id or range: {target}"
                    )));
                }
                match client.request(&Request::Delete { task_ids }).await? {
                    Response::Deleted { results } => {
                        for result in results {
                            if result.success {
                                println!("Deleted task {}", result.id);
                            } else {
                                println!("Task {} not found", result.id);
                            }
                        }
                    }
                    other => print_unexpected(&other),
                }
            }
        }

        Command::Info { id } => {
            let mut client = IpcClient::connect(&socket).await?;
            match client.request(&Request::Info { task_id: id }).await? {
                Response::TaskDetail(detail) => {
                    println!("Task {}", detail.id);
                    println!("  Status:         {}", detail.status);
                    println!("  Script:         {}", detail.script);
                    println!("  Workdir:        {}", detail.workdir);
                    println!("  Requested:      {} cpu, {} gpu", detail.ncpu, detail.ngpu);
                    if !detail.specific_cpus.is_empty() || !detail.specific_gpus.is_empty() {
                        println!(
                            "  Requested sets: cpus [{}], gpus [{}]",
                            join_ids(&detail.specific_cpus),
                            join_ids(&detail.specific_gpus)
                        );
                    }
                    println!("  Allocated CPUs: {}", join_ids(&detail.allocated_cpus));
                    println!("  Allocated GPUs: {}", join_ids(&detail.allocated_gpus));
                    if !detail.log_file.is_empty() {
                        println!("  Log file:       {}", detail.log_file);
                    }
                    println!("  PID:            {}", detail.pid);
                    match detail.exit_code {
                        Some(code) => println!("  Exit code:      {code}"),
                        None => println!("  Exit code:      -"),
                    }
                    println!("  Submitted:      {}", detail.submit_time);
                    println!(
                        "  Started:        {}",
                        detail.start_time.as_deref().unwrap_or("-")
                    );
                    println!(
                        "  Ended:          {}",
                        detail.end_time.as_deref().unwrap_or("-")
                    );
                    println!("  Duration:       {}", format_duration(detail.duration_seconds));
                }
                other => print_unexpected(&other),
            }
        }

        Command::Log { id, tail } => {
            let mut client = IpcClient::connect(&socket).await?;
            match client
                .request(&Request::Log {
                    task_id: id,
                    tail_lines: tail,
                })
                .await?
            {
                Response::TaskLog(log) => {
                    eprintln!("==> {} <==", log.log_path);
                    print!("{}", log.content);
                }
                other => print_unexpected(&other),
            }
        }

        Command::Resources => {
            // Measured locally; no daemon required.
            let ledger = ResourceLedger::new(&Config::default());
            print_resources(&ledger).await;
        }

        Command::Stop => {
            let mut client = IpcClient::connect(&socket).await?;
            match client.request(&Request::Shutdown).await? {
                Response::ShuttingDown => println!("Daemon is shutting down"),
                other => print_unexpected(&other),
            }
        }
    }

    Ok(())
}

fn print_queue(view: &QueueView, all: bool, summary: bool) {
    if summary {
        println!(
            "{} running, {} pending{}",
            view.running.len(),
            view.pending.len(),
            if all {
                format!(", {} finished", view.terminal.len())
            } else {
                String::new()
            }
        );
        return;
    }

    println!(
        "{:<6} {:<10} {:<9} {:<12} {:<12} {:<6} {}",
        "ID", "STATUS", "TIME", "CPUS", "GPUS", "EXIT", "WORKDIR"
    );
    for row in view
        .running
        .iter()
        .chain(view.pending.iter())
        .chain(view.terminal.iter())
    {
        print_row(row);
    }
    println!("\n{} running, {} pending", view.running.len(), view.pending.len());
}

fn print_row(row: &TaskView) {
    println!(
        "{:<6} {:<10} {:<9} {:<12} {:<12} {:<6} {}",
        row.id,
        row.status.to_string(),
        format_duration(row.duration_seconds),
        join_ids(&row.cpus),
        join_ids(&row.gpus),
        row.exit_code.map_or("-".to_string(), |c| c.to_string()),
        row.workdir
    );
}

async fn print_resources(ledger: &ResourceLedger) {
    println!("GPUs:");
    println!(
        "  {:<4} {:>10} {:>10}  {}",
        "ID", "USED(MB)", "TOTAL(MB)", "STATE"
    );
    for gpu in ledger.gpu_status().await {
        println!(
            "  {:<4} {:>10} {:>10}  {}",
            gpu.device_id,
            gpu.memory_used_mb,
            gpu.memory_total_mb,
            if gpu.busy { "busy" } else { "free" }
        );
    }

    println!("\nCPUs:");
    println!("  {:<6} {:>8}  {:<6} {}", "CORE", "UTIL(%)", "GROUP", "STATE");
    for cpu in ledger.cpu_status().await {
        println!(
            "  {:<6} {:>8.1}  {:<6} {}",
            cpu.core_id,
            cpu.utilization,
            cpu.affinity_group,
            if cpu.reserved { "reserved" } else { "free" }
        );
    }
}

fn format_duration(seconds: i64) -> String {
    if seconds <= 0 {
        return "-".to_string();
    }
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn print_unexpected(response: &Response) {
    match response {
        Response::Error { message } => {
            eprintln!("error: {message}");
            std::process::exit(1);
        }
        other => {
            eprintln!("error: unexpected response: {other:?}");
            std::process::exit(1);
        }
    }
}
