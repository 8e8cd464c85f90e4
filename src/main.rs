use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use myqueue::config::{parse_id_list, Config};
use myqueue::daemon::Daemon;
use myqueue::shutdown;

#[derive(Parser, Debug)]
#[command(name = "myqueued")]
#[command(about = "A user-level GPU/CPU job queue daemon")]
struct Args {
    /// Unix socket to listen on (default: /tmp/myqueue_<user>.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Data directory (default: ~/.myqueue/<hostname>)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write server and per-task logs to this directory
    #[arg(long)]
    log: Option<PathBuf>,

    /// Write per-job output to workdir/job.log when a task names no log file
    #[arg(long)]
    joblog: bool,

    /// GPU busy threshold in MB of used memory
    #[arg(long, default_value = "2000")]
    gpumemory: u64,

    /// CPU busy threshold in percent utilization
    #[arg(long, default_value = "40.0")]
    cpuusage: f64,

    /// CPU cores never handed out, comma-separated (e.g. "0,1")
    #[arg(long, default_value = "")]
    excpus: String,

    /// GPU devices never handed out, comma-separated
    #[arg(long, default_value = "")]
    exgpus: String,

    /// Total CPU cores on this host
    #[arg(long, default_value = "64")]
    total_cpus: usize,

    /// Total GPU devices on this host
    #[arg(long, default_value = "8")]
    total_gpus: usize,

    /// Clear any persisted queue before starting
    #[arg(long)]
    init: bool,
}

fn config_from_args(args: &Args) -> Config {
    let mut config = Config::default();
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(log_dir) = &args.log {
        config.enable_logging = true;
        config.log_dir = log_dir.clone();
    }
    config.enable_job_log = args.joblog;
    config.gpu_memory_threshold_mb = args.gpumemory;
    config.cpu_util_threshold = args.cpuusage;
    config.excluded_cpus = parse_id_list(&args.excpus);
    config.excluded_gpus = parse_id_list(&args.exgpus);
    config.total_cpus = args.total_cpus;
    config.total_gpus = args.total_gpus;
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = config_from_args(&args);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.enable_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_dir.join("server.log"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(log_file))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if args.init {
        let tasks_file = config.tasks_file();
        if tasks_file.exists() {
            std::fs::remove_file(&tasks_file)?;
            tracing::info!(path = %tasks_file.display(), "Cleared persisted queue");
        }
    }

    tracing::info!(
        socket = %config.socket_path.display(),
        data_dir = %config.data_dir.display(),
        gpu_memory_threshold_mb = config.gpu_memory_threshold_mb,
        cpu_util_threshold = config.cpu_util_threshold,
        "Starting myqueued"
    );

    config.save()?;

    let daemon = Daemon::new(config);
    shutdown::watch_signals(daemon.shutdown_token());
    daemon.run().await?;

    Ok(())
}
