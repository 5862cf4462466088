use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use remote_runner::config::{HostKeyPolicy, RunnerConfig};
use remote_runner::remote::executor::{CommandExecutor, CommandOutput, RunOptions};
use remote_runner::remote::ops::{self, HostOps, ONLINE_RETRY_INTERVAL, ONLINE_TIMEOUT};
use remote_runner::remote::os;
use remote_runner::remote::sync::FileSync;
use remote_runner::runner::Runner;
use remote_runner::scheduler::{ExecutionRequest, JobRecord, MemoryJobStore};
use remote_runner::shutdown::install_shutdown_handler;
use remote_runner::ssh::{
    Connection, ConnectionManager, ConnectionParams, Credential, OutputChunk, OutputStream,
};

#[derive(Parser, Debug)]
#[command(name = "remote-runner")]
#[command(version)]
#[command(about = "Run commands, scripts and file transfers on remote hosts over SSH")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    auth: AuthArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

// =============================================================================
// Connection Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct AuthArgs {
    /// Password for password authentication
    #[arg(long, env = "REMOTE_RUNNER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file for public-key authentication
    #[arg(long, short = 'i')]
    key: Option<PathBuf>,

    /// Passphrase protecting the private key
    #[arg(long, env = "REMOTE_RUNNER_KEY_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Expected SHA-256 host key fingerprint (hex). Unset accepts any key.
    #[arg(long)]
    host_key: Option<String>,

    /// TCP connect and handshake timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a command on a host
    Exec {
        /// Target as user@host[:port]
        target: String,
        /// The command line to run
        command: String,
        /// Give up after this many seconds
        #[arg(long, short = 't')]
        timeout: Option<u64>,
        /// Do not stream output while the command runs
        #[arg(long, short = 'q')]
        quiet: bool,
    },
    /// Detect the remote operating system
    Detect {
        target: String,
    },
    /// Upload a file or directory
    Push {
        target: String,
        /// Local file or directory
        path: PathBuf,
        /// Remote directory (default: a fresh scratch directory in the remote home)
        #[arg(long)]
        dest: Option<String>,
    },
    /// Download a file
    Pull {
        target: String,
        /// Remote file path
        remote: String,
        /// Local destination file
        local: PathBuf,
    },
    /// Upload a Python script and run it
    Script {
        target: String,
        file: PathBuf,
        #[arg(long, short = 't')]
        timeout: Option<u64>,
    },
    /// Run a PowerShell snippet
    Powershell {
        target: String,
        script: String,
        #[arg(long, short = 't')]
        timeout: Option<u64>,
    },
    /// Run one command on many hosts through the job scheduler
    Batch {
        /// Comma-separated targets, each user@host[:port]
        #[arg(long, value_delimiter = ',', required = true)]
        hosts: Vec<String>,
        command: String,
        /// Maximum number of hosts worked on at once
        #[arg(long, default_value = "10")]
        capacity: usize,
        #[arg(long, short = 't')]
        timeout: Option<u64>,
        /// Log each host's output as it arrives
        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Restart a host, optionally waiting for it to come back
    Reboot {
        target: String,
        #[arg(long)]
        wait: bool,
    },
    /// Ping a host from this machine
    Ping {
        host: String,
        #[arg(long, short = 'c', default_value = "5")]
        count: u32,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ExecOutput {
    target: String,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
    success: bool,
    elapsed_secs: f64,
}

#[derive(Serialize)]
struct DetectOutput {
    target: String,
    os: os::RemoteOs,
}

#[derive(Serialize)]
struct TransferOutput {
    target: String,
    local: String,
    remote: String,
}

#[derive(Serialize)]
struct PingOutput {
    host: String,
    reachable: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn runner_config(auth: &AuthArgs) -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.connect.connect_timeout = Duration::from_secs(auth.connect_timeout);
    if let Some(fingerprint) = &auth.host_key {
        config.connect.host_key_policy = HostKeyPolicy::Fingerprint(fingerprint.to_lowercase());
    }
    config
}

fn credential(auth: &AuthArgs) -> Result<Credential, Box<dyn std::error::Error>> {
    match (&auth.key, &auth.password) {
        (Some(path), _) => Ok(Credential::KeyFile {
            path: path.clone(),
            passphrase: auth.passphrase.clone(),
        }),
        (None, Some(password)) => Ok(Credential::Password(password.clone())),
        (None, None) => Err("either --password or --key is required".into()),
    }
}

fn parse_target(target: &str, auth: &AuthArgs) -> Result<ConnectionParams, Box<dyn std::error::Error>> {
    ConnectionParams::parse(target, credential(auth)?)
        .ok_or_else(|| format!("invalid target '{}', expected user@host[:port]", target).into())
}

async fn connect(
    target: &str,
    auth: &AuthArgs,
    config: &RunnerConfig,
) -> Result<(ConnectionManager, Connection), Box<dyn std::error::Error>> {
    let params = parse_target(target, auth)?;
    let manager = ConnectionManager::new(config.connect.clone());
    let conn = manager.open(params).await?;
    Ok((manager, conn))
}

/// Print chunks to the local terminal as they arrive.
fn terminal_sink() -> (mpsc::UnboundedSender<OutputChunk>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
    let printer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let _ = match chunk.stream {
                OutputStream::Stdout => std::io::stdout().write_all(&chunk.data),
                OutputStream::Stderr => std::io::stderr().write_all(&chunk.data),
            };
        }
        let _ = std::io::stdout().flush();
    });
    (tx, printer)
}

fn timeout_arg(seconds: Option<u64>) -> Option<Duration> {
    seconds.map(Duration::from_secs)
}

fn print_command_output(
    target: &str,
    output: &CommandOutput,
    streamed: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let out = ExecOutput {
                target: target.to_string(),
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
                exit_code: output.exit_code(),
                timed_out: output.timed_out(),
                success: output.succeeded(),
                elapsed_secs: output.elapsed.as_secs_f64(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if !streamed {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
            }
            if output.timed_out() {
                eprintln!(
                    "Command timed out after {:.1}s (remote process may still be running)",
                    output.elapsed.as_secs_f64()
                );
            } else if let Some(code) = output.exit_code().filter(|c| *c != 0) {
                eprintln!("Exit code: {}", code);
            }
        }
    }
    Ok(())
}

fn print_records(
    records: &[JobRecord],
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        OutputFormat::Table => {
            println!("{:<38} {:<28} {:<10} DURATION", "JOB ID", "TARGET", "STATUS");
            println!("{}", "-".repeat(88));
            for record in records {
                println!(
                    "{:<38} {:<28} {:<10} {:.1}s",
                    record.id,
                    record.target_id,
                    record.status,
                    record.duration_secs.unwrap_or_default()
                );
            }
            for record in records {
                if record.output.is_empty() && record.error.is_empty() {
                    continue;
                }
                println!();
                println!("== {} ({}) ==", record.target_id, record.status);
                for line in record.output.lines() {
                    println!("  {}", line);
                }
                for line in record.error.lines() {
                    println!("  ! {}", line);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_exec(
    auth: &AuthArgs,
    target: String,
    command: String,
    timeout: Option<u64>,
    quiet: bool,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth);
    let (manager, mut conn) = connect(&target, auth, &config).await?;
    let executor = CommandExecutor::new(config.executor.clone());

    let mut options = RunOptions {
        timeout: timeout_arg(timeout),
        ..RunOptions::default()
    };
    let stream = !quiet && matches!(output_format, OutputFormat::Table);
    let printer = if stream {
        let (sink, printer) = terminal_sink();
        options = options.streaming(sink);
        Some(printer)
    } else {
        None
    };

    let result = executor.run(&conn, &command, options).await;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    manager.close(&mut conn).await;

    let output = result?;
    print_command_output(&conn.target_id(), &output, stream, output_format)?;
    Ok(output.succeeded())
}

async fn handle_detect(
    auth: &AuthArgs,
    target: String,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth);
    let (manager, mut conn) = connect(&target, auth, &config).await?;
    let executor = CommandExecutor::new(config.executor.clone());
    let detected = os::resolve(&executor, &conn).await;
    manager.close(&mut conn).await;

    match output_format {
        OutputFormat::Json => {
            let out = DetectOutput {
                target: conn.target_id(),
                os: detected,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => println!("{}: {}", conn.target_id(), detected),
    }
    Ok(detected.is_known())
}

async fn handle_push(
    auth: &AuthArgs,
    target: String,
    path: PathBuf,
    dest: Option<String>,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth);
    let (manager, mut conn) = connect(&target, auth, &config).await?;
    let sync = FileSync::new(CommandExecutor::new(config.executor.clone()));

    let result = if path.is_dir() {
        sync.send_directory(&conn, &path, dest.as_deref()).await
    } else {
        sync.send_file(&conn, &path, dest.as_deref()).await
    };
    manager.close(&mut conn).await;
    let remote = result?;

    match output_format {
        OutputFormat::Json => {
            let out = TransferOutput {
                target: conn.target_id(),
                local: path.display().to_string(),
                remote,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => println!("Uploaded {} -> {}", path.display(), remote),
    }
    Ok(true)
}

async fn handle_pull(
    auth: &AuthArgs,
    target: String,
    remote: String,
    local: PathBuf,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth);
    let (manager, mut conn) = connect(&target, auth, &config).await?;
    let sync = FileSync::new(CommandExecutor::new(config.executor.clone()));
    let result = sync.receive_file(&conn, &remote, &local).await;
    manager.close(&mut conn).await;
    let bytes = result?;

    match output_format {
        OutputFormat::Json => {
            let out = TransferOutput {
                target: conn.target_id(),
                local: local.display().to_string(),
                remote,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Downloaded {} -> {} ({} bytes)", remote, local.display(), bytes)
        }
    }
    Ok(true)
}

enum HostAction {
    Script(PathBuf),
    PowerShell(String),
}

async fn handle_host_action(
    auth: &AuthArgs,
    target: String,
    action: HostAction,
    timeout: Option<u64>,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth);
    let (manager, mut conn) = connect(&target, auth, &config).await?;
    let ops = HostOps::new(CommandExecutor::new(config.executor.clone()));
    let options = RunOptions {
        timeout: timeout_arg(timeout),
        ..RunOptions::default()
    };

    let result = match action {
        HostAction::Script(file) => ops.run_script(&conn, &file, options).await,
        HostAction::PowerShell(script) => ops.run_powershell(&conn, &script, options).await,
    };
    manager.close(&mut conn).await;

    let output = result?;
    print_command_output(&conn.target_id(), &output, false, output_format)?;
    Ok(output.succeeded())
}

async fn handle_batch(
    auth: &AuthArgs,
    hosts: Vec<String>,
    command: String,
    capacity: usize,
    timeout: Option<u64>,
    verbose: bool,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth).with_pool_capacity(capacity);
    let runner = Runner::new(config, Arc::new(MemoryJobStore::new()));
    let shutdown = install_shutdown_handler();

    let mut ids = Vec::with_capacity(hosts.len());
    for host in &hosts {
        let mut request = ExecutionRequest::command(parse_target(host, auth)?, command.clone())
            .verbose(verbose);
        if let Some(timeout) = timeout_arg(timeout) {
            request = request.with_timeout(timeout);
        }
        ids.push(runner.submit(request).await);
    }

    let scheduler = runner.scheduler().clone();
    let wait_all = async {
        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            records.push(scheduler.wait(*id).await);
        }
        records
    };

    let results = tokio::select! {
        results = wait_all => results,
        _ = shutdown.cancelled() => {
            for id in &ids {
                runner.scheduler().cancel(*id).await;
            }
            let mut records = Vec::with_capacity(ids.len());
            for id in &ids {
                records.push(runner.scheduler().status(*id).await);
            }
            records
        }
    };
    runner.shutdown().await;

    let records = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    print_records(&records, output_format)?;
    Ok(records
        .iter()
        .all(|r| r.status == remote_runner::scheduler::JobStatus::Success))
}

async fn handle_reboot(
    auth: &AuthArgs,
    target: String,
    wait: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = runner_config(auth);
    let (manager, mut conn) = connect(&target, auth, &config).await?;
    let ops = HostOps::new(CommandExecutor::new(config.executor.clone()));
    let result = ops.reboot(&conn).await;
    manager.close(&mut conn).await;
    if let Err(e) = result {
        tracing::debug!(error = %e, "Reboot command ended with an error");
    }
    println!("Reboot requested for {}", conn.target_id());

    if wait {
        // Give the host time to go down before polling.
        tokio::time::sleep(ONLINE_RETRY_INTERVAL).await;
        let mut back = HostOps::wait_until_online(
            &manager,
            conn.params(),
            ONLINE_TIMEOUT,
            ONLINE_RETRY_INTERVAL,
        )
        .await?;
        println!("{} is back online", back.target_id());
        manager.close(&mut back).await;
    }
    Ok(true)
}

async fn handle_ping(
    host: String,
    count: u32,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let reachable = ops::ping(&host, count).await?;
    match output_format {
        OutputFormat::Json => {
            let out = PingOutput {
                host: host.clone(),
                reachable,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            let state = if reachable { "reachable" } else { "unreachable" };
            println!("{}: {}", host, state);
        }
    }
    Ok(reachable)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let auth = &args.auth;
    let output = &args.output;

    let ok = match args.command {
        Commands::Exec {
            target,
            command,
            timeout,
            quiet,
        } => handle_exec(auth, target, command, timeout, quiet, output).await?,
        Commands::Detect { target } => handle_detect(auth, target, output).await?,
        Commands::Push { target, path, dest } => {
            handle_push(auth, target, path, dest, output).await?
        }
        Commands::Pull {
            target,
            remote,
            local,
        } => handle_pull(auth, target, remote, local, output).await?,
        Commands::Script {
            target,
            file,
            timeout,
        } => handle_host_action(auth, target, HostAction::Script(file), timeout, output).await?,
        Commands::Powershell {
            target,
            script,
            timeout,
        } => {
            handle_host_action(auth, target, HostAction::PowerShell(script), timeout, output)
                .await?
        }
        Commands::Batch {
            hosts,
            command,
            capacity,
            timeout,
            verbose,
        } => handle_batch(auth, hosts, command, capacity, timeout, verbose, output).await?,
        Commands::Reboot { target, wait } => handle_reboot(auth, target, wait).await?,
        Commands::Ping { host, count } => handle_ping(host, count, output).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
