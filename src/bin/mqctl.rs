use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use ipc_mq::{QueueConfig, SharedQueue};

#[derive(Parser)]
#[command(name = "mqctl", version, about = "Inspect and drive ipc-mq queues")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Emulated queues living in a shared-memory file.
    #[command(subcommand)]
    Shm(ShmCommand),
    /// POSIX kernel message queues (Linux only).
    #[command(subcommand)]
    Kernel(KernelCommand),
}

#[derive(Args)]
struct Dimensions {
    #[arg(long, default_value_t = ipc_mq::config::DEFAULT_CAPACITY)]
    capacity: usize,
    #[arg(long = "max-msg-size", default_value_t = ipc_mq::config::DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,
    #[arg(long, default_value_t = ipc_mq::config::DEFAULT_MODE)]
    mode: u32,
}

impl Dimensions {
    fn config(&self) -> QueueConfig {
        QueueConfig::new(self.capacity, self.max_message_size).with_mode(self.mode)
    }
}

#[derive(Subcommand)]
enum ShmCommand {
    Create {
        path: PathBuf,
        #[command(flatten)]
        dims: Dimensions,
    },
    Send {
        path: PathBuf,
        message: String,
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
    Recv {
        path: PathBuf,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
    Len {
        path: PathBuf,
    },
    Destroy {
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum KernelCommand {
    Create {
        name: String,
        #[command(flatten)]
        dims: Dimensions,
    },
    Send {
        name: String,
        message: String,
        #[arg(short, long, default_value_t = 0)]
        priority: u32,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
    Recv {
        name: String,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
    Attrs {
        name: String,
    },
    /// Print one line per "became non-empty" notification.
    Watch {
        name: String,
        #[arg(long)]
        count: Option<usize>,
    },
    Unlink {
        name: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Shm(cmd) => run_shm(cmd),
        Commands::Kernel(cmd) => run_kernel(cmd),
    }
}

fn open_shm(path: &Path) -> Result<SharedQueue> {
    SharedQueue::open(path).with_context(|| format!("open {}", path.display()))
}

fn run_shm(cmd: ShmCommand) -> Result<()> {
    match cmd {
        ShmCommand::Create { path, dims } => {
            SharedQueue::create(&path, &dims.config())
                .with_context(|| format!("create {}", path.display()))?;
            info!("created {}", path.display());
        }
        ShmCommand::Send {
            path,
            message,
            priority,
            timeout_ms,
        } => {
            let mut queue = open_shm(&path)?;
            match timeout_ms {
                Some(ms) => {
                    queue.send_timeout(message.as_bytes(), priority, Duration::from_millis(ms))?
                }
                None => queue.send(message.as_bytes(), priority)?,
            }
        }
        ShmCommand::Recv { path, timeout_ms } => {
            let mut queue = open_shm(&path)?;
            let mut buf = vec![0u8; queue.max_message_size()];
            let (len, priority) = match timeout_ms {
                Some(ms) => queue.receive_timeout(&mut buf, Duration::from_millis(ms))?,
                None => queue.receive(&mut buf)?,
            };
            println!("{priority}\t{}", String::from_utf8_lossy(&buf[..len]));
        }
        ShmCommand::Len { path } => {
            let queue = open_shm(&path)?;
            println!("{}/{}", queue.len(), queue.capacity());
        }
        ShmCommand::Destroy { path } => {
            SharedQueue::destroy(&path).with_context(|| format!("destroy {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_kernel(cmd: KernelCommand) -> Result<()> {
    use ipc_mq::mq::KernelQueue;

    match cmd {
        KernelCommand::Create { name, dims } => {
            KernelQueue::create(&name, &dims.config()).with_context(|| format!("create {name}"))?;
            info!("created {name}");
        }
        KernelCommand::Send {
            name,
            message,
            priority,
            timeout_ms,
        } => {
            let queue = KernelQueue::open(&name).with_context(|| format!("open {name}"))?;
            match timeout_ms {
                Some(ms) => {
                    queue.send_timeout(message.as_bytes(), priority, Duration::from_millis(ms))?
                }
                None => queue.send(message.as_bytes(), priority)?,
            }
        }
        KernelCommand::Recv { name, timeout_ms } => {
            let queue = KernelQueue::open(&name).with_context(|| format!("open {name}"))?;
            let mut buf = vec![0u8; queue.max_message_size()?];
            let (len, priority) = match timeout_ms {
                Some(ms) => queue.receive_timeout(&mut buf, Duration::from_millis(ms))?,
                None => queue.receive(&mut buf)?,
            };
            println!("{priority}\t{}", String::from_utf8_lossy(&buf[..len]));
        }
        KernelCommand::Attrs { name } => {
            let queue = KernelQueue::open(&name).with_context(|| format!("open {name}"))?;
            let attrs = queue.attributes()?;
            println!(
                "messages {}/{} max_message_size {} nonblocking {}",
                attrs.current_messages,
                attrs.max_messages,
                attrs.max_message_size,
                attrs.is_nonblocking()
            );
        }
        KernelCommand::Watch { name, count } => {
            let queue = KernelQueue::open(&name).with_context(|| format!("open {name}"))?;
            let mut session = queue.notify().context("arm notifications")?;
            info!(
                "watching {name}; cancel with a connection to {}",
                session.rendezvous_path().display()
            );
            let mut seen = 0usize;
            for id in session.events().iter() {
                println!("non-empty {name} (fd {id})");
                seen += 1;
                if count.map_or(false, |count| seen >= count) {
                    break;
                }
            }
            if !session.is_finished() {
                session.cancel()?;
            }
        }
        KernelCommand::Unlink { name } => {
            KernelQueue::destroy(&name).with_context(|| format!("unlink {name}"))?;
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_kernel(_cmd: KernelCommand) -> Result<()> {
    anyhow::bail!("kernel message queues are only available on Linux")
}
