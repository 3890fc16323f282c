use crate::server::session::queue::Backpressure;
use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::{num::NonZeroUsize, time::Duration};
use huddle_core::{
    engine::{CommandEngine, EchoEngine, GenerationEngine},
    prompt::DEFAULT_SYSTEM_PROMPT,
};

/// Runtime configuration for the `huddle-server` binary.
///
/// These settings control concurrency, buffering, timeouts and the
/// generation engine. All values are parsed from CLI arguments or
/// environment variables (a `.env` file is honoured), with defaults suitable
/// for a single-room deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "huddle-server",
    version,
    about = "A WebSocket chat relay with a shared, serialized AI participant"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub server_addr: String,

    /// Number of worker tasks draining the inbound queue.
    ///
    /// Workers broadcast in parallel but generations are always serialized,
    /// so more workers mostly help fan-out to many clients.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Maximum number of accepted messages waiting for a worker.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// What happens when the inbound queue is full.
    ///
    /// `block` stops reading from the sending connection until there is
    /// room; `reject` drops the message and keeps the connection open.
    ///
    /// Environment variable: `BACKPRESSURE`
    #[arg(long, env = "BACKPRESSURE", value_enum, default_value_t = Backpressure::Block)]
    pub backpressure: Backpressure,

    /// Capacity of each connection's outbound frame buffer.
    ///
    /// Environment variable: `OUTBOUND_BUFFER_SIZE`
    #[arg(long, env = "OUTBOUND_BUFFER_SIZE", default_value_t = 64)]
    pub outbound_buffer_size: usize,

    /// How long a broadcast waits for a slow client before evicting it.
    ///
    /// Environment variable: `SEND_TIMEOUT_MS`
    #[arg(long, env = "SEND_TIMEOUT_MS", default_value_t = 5000)]
    pub send_timeout_ms: u64,

    /// Deadline for one generation in seconds. `0` waits indefinitely.
    ///
    /// Environment variable: `GENERATION_TIMEOUT_SECS`
    #[arg(long, env = "GENERATION_TIMEOUT_SECS", default_value_t = 0)]
    pub generation_timeout_secs: u64,

    /// Number of past exchanges kept as context. `0` keeps all of them.
    ///
    /// Environment variable: `HISTORY_LIMIT`
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 0)]
    pub history_limit: usize,

    /// System text placed at the top of every prompt.
    ///
    /// Environment variable: `SYSTEM_PROMPT`
    #[arg(long, env = "SYSTEM_PROMPT", default_value_t = String::from(DEFAULT_SYSTEM_PROMPT))]
    pub system_prompt: String,

    /// Generation engine to run.
    ///
    /// Environment variable: `ENGINE`
    #[arg(long, env = "ENGINE", value_enum, default_value_t = EngineKind::Echo)]
    pub engine: EngineKind,

    /// Completion program for the `command` engine. It receives the prompt
    /// on stdin and prints the response.
    ///
    /// Environment variable: `ENGINE_COMMAND`
    #[arg(long, env = "ENGINE_COMMAND")]
    pub engine_command: Option<String>,

    /// Arguments passed to `ENGINE_COMMAND`, whitespace separated.
    ///
    /// Environment variable: `ENGINE_ARGS`
    #[arg(long, env = "ENGINE_ARGS", allow_hyphen_values = true, default_value_t = String::new())]
    pub engine_args: String,

    /// Artificial latency for the `echo` engine in milliseconds.
    ///
    /// Environment variable: `ECHO_DELAY_MS`
    #[arg(long, env = "ECHO_DELAY_MS", default_value_t = 0)]
    pub echo_delay_ms: u64,

    /// Seconds to wait for queued messages to drain during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Replies with the user's own words.
    Echo,
    /// Pipes prompts through an external program.
    Command,
}

/// Validated engine selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineConfig {
    Echo { delay: Duration },
    Command { program: String, args: Vec<String> },
}

impl EngineConfig {
    pub fn build(&self) -> Box<dyn GenerationEngine> {
        match self {
            EngineConfig::Echo { delay } => Box::new(EchoEngine::new(*delay)),
            EngineConfig::Command { program, args } => {
                Box::new(CommandEngine::new(program.clone(), args.clone()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    pub outbound_buffer_size: usize,
    pub send_timeout: Duration,
    pub generation_timeout: Option<Duration>,
    pub history_limit: Option<NonZeroUsize>,
    pub system_prompt: String,
    pub engine: EngineConfig,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8000".to_string(),
            num_workers: 4,
            queue_capacity: 1024,
            backpressure: Backpressure::Block,
            outbound_buffer_size: 64,
            send_timeout: Duration::from_millis(5000),
            generation_timeout: None,
            history_limit: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            engine: EngineConfig::Echo {
                delay: Duration::ZERO,
            },
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        if args.outbound_buffer_size == 0 {
            bail!("OUTBOUND_BUFFER_SIZE must be greater than 0");
        }

        if args.send_timeout_ms == 0 {
            bail!("SEND_TIMEOUT_MS must be greater than 0");
        }

        let engine = match args.engine {
            EngineKind::Echo => EngineConfig::Echo {
                delay: Duration::from_millis(args.echo_delay_ms),
            },
            EngineKind::Command => {
                let Some(program) = args.engine_command.filter(|p| !p.trim().is_empty()) else {
                    bail!("ENGINE_COMMAND is required when ENGINE=command");
                };
                EngineConfig::Command {
                    program,
                    args: args
                        .engine_args
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                }
            }
        };

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            queue_capacity: args.queue_capacity,
            backpressure: args.backpressure,
            outbound_buffer_size: args.outbound_buffer_size,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            generation_timeout: (args.generation_timeout_secs > 0)
                .then(|| Duration::from_secs(args.generation_timeout_secs)),
            history_limit: NonZeroUsize::new(args.history_limit),
            system_prompt: args.system_prompt,
            engine,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
