use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use sdr_core::{
    AnswerOptions, Assistant, AssistantReply, Config, ConfigLoader, EvaluationHarness,
    EvaluationMetrics, TelemetryOptions, ToolStatus, init_telemetry, log_base_dir, log_request_completion,
    metrics::init_metrics_from_env, persist_trace, remove_request_logs,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const AGENT_MODE_ENV: &str = "SDR_AGENT_MODE";

#[derive(Parser, Debug)]
#[command(name = "sdr", version, about = "Sales research assistant")]
struct Cli {
    /// Configuration file (defaults to `SDR_CONFIG`, then `./sdr.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a single request and exit.
    Ask(AskArgs),
    /// Interactive session; `exit` or `quit` ends it.
    Chat(DisplayArgs),
    /// Summarise answer quality from the request log.
    Eval(EvalArgs),
    /// Remove every logged record of a request.
    Purge(PurgeArgs),
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Request text, optionally prefixed by a `{"format": "json", "fields": {...}}` envelope.
    #[arg(required = true, num_args = 1..)]
    input: Vec<String>,

    #[command(flatten)]
    display: DisplayArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct DisplayArgs {
    /// List every tool call made for the answer.
    #[arg(long)]
    show_tools: bool,

    /// Print how the answer was researched.
    #[arg(long, value_enum)]
    explain: Option<ExplainFormat>,

    /// Print the full reply as JSON.
    #[arg(long)]
    json: bool,

    /// Skip the request log for this invocation.
    #[arg(long)]
    no_log: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ExplainFormat {
    Markdown,
    Mermaid,
}

#[derive(Args, Debug)]
struct EvalArgs {
    /// Request log directory (defaults to `SDR_LOG_DIR`, then `data/logs`).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Analyse a single `requests.jsonl` file instead of the whole log tree.
    #[arg(long, conflicts_with = "log_dir")]
    file: Option<PathBuf>,

    /// Comma-separated terms each answer is expected to mention.
    #[arg(long, value_delimiter = ',')]
    keywords: Vec<String>,

    /// Print metrics as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PurgeArgs {
    /// Request id to erase.
    request_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let command = match cli.command {
            Some(command) => command,
            None if interactive_mode() => Command::Chat(DisplayArgs::default()),
            None => {
                Cli::command().print_help()?;
                return Ok(());
            }
        };

        match command {
            Command::Ask(args) => ask_command(cli.config, args).await?,
            Command::Chat(args) => chat_command(cli.config, args).await?,
            Command::Eval(args) => eval_command(args)?,
            Command::Purge(args) => {
                remove_request_logs(&args.request_id)?;
                println!("removed logs for request {}", args.request_id);
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn interactive_mode() -> bool {
    std::env::var(AGENT_MODE_ENV)
        .map(|mode| mode.trim().eq_ignore_ascii_case("interactive"))
        .unwrap_or(false)
}

fn setup(config_path: Option<PathBuf>) -> Result<(Config, Assistant)> {
    let config = ConfigLoader::load(config_path).context("failed to load configuration")?;
    init_telemetry(TelemetryOptions {
        default_level: Some(config.logging.level.clone()),
        ..TelemetryOptions::default()
    })?;
    init_metrics_from_env("sdr-cli")?;
    let assistant = Assistant::from_config(&config).context("failed to build assistant")?;
    Ok((config, assistant))
}

async fn ask_command(config_path: Option<PathBuf>, args: AskArgs) -> Result<()> {
    let (config, assistant) = setup(config_path)?;
    let input = args.input.join(" ");
    let reply = answer_interruptibly(&assistant, &config, &input, &args.display)
        .await
        .context("request rejected")?;
    present(&config, &reply, &args.display)
}

async fn chat_command(config_path: Option<PathBuf>, display: DisplayArgs) -> Result<()> {
    let (config, assistant) = setup(config_path)?;
    println!("Sales research assistant. Type `exit` or `quit` to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit_command(input) {
            break;
        }

        match answer_interruptibly(&assistant, &config, input, &display).await {
            Ok(reply) => present(&config, &reply, &display)?,
            Err(err) => eprintln!("request rejected: {err}"),
        }
    }

    info!("chat session ended");
    Ok(())
}

fn is_exit_command(input: &str) -> bool {
    matches!(input.to_ascii_lowercase().as_str(), "exit" | "quit")
}

/// Answer `input`; Ctrl-C cancels research and returns whatever evidence landed.
async fn answer_interruptibly(
    assistant: &Assistant,
    config: &Config,
    input: &str,
    display: &DisplayArgs,
) -> Result<AssistantReply, sdr_core::ClassificationError> {
    let cancel = CancellationToken::new();
    let collect_trace = display.explain.is_some() || config.logging.trace_dir.is_some();
    let pending = assistant.answer_with_options(
        AnswerOptions::new(input)
            .with_cancellation(cancel.clone())
            .with_trace(collect_trace),
    );
    tokio::pin!(pending);

    loop {
        tokio::select! {
            reply = &mut pending => return reply,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("interrupted; answering from research gathered so far");
                cancel.cancel();
            }
        }
    }
}

fn present(config: &Config, reply: &AssistantReply, display: &DisplayArgs) -> Result<()> {
    if display.json {
        println!("{}", serde_json::to_string_pretty(reply)?);
    } else {
        println!("{}", reply.answer.render());
        if reply.request.is_structured() && !reply.answer.citations.is_empty() {
            println!("\nSources: {}", reply.answer.citations.join(", "));
        }
        for warning in &reply.warnings {
            eprintln!(
                "warning: `{}` from {} is not a valid {}",
                warning.field, warning.source_label, warning.expected
            );
        }
        if reply.timed_out {
            eprintln!("note: the request deadline was reached before research finished");
        }
    }

    if display.show_tools {
        println!(
            "\nTools used ({} cycle(s), stopped: {}):",
            reply.cycles,
            reply.stop_reason.as_str()
        );
        for usage in &reply.tools {
            let status = match usage.status {
                ToolStatus::Ok => "ok",
                ToolStatus::Error => "error",
            };
            print!(
                "- {} [{}] {} (attempts: {})",
                usage.tool, status, usage.source_label, usage.attempts
            );
            match &usage.error {
                Some(error) => println!(": {error}"),
                None => println!(),
            }
        }
    }

    if let (Some(format), Some(trace)) = (display.explain, reply.trace.as_ref()) {
        let summary = trace.summary();
        let rendered = match format {
            ExplainFormat::Markdown => summary.render_markdown(),
            ExplainFormat::Mermaid => summary.render_mermaid(),
        };
        println!("\n{rendered}");
    }

    if config.logging.request_log && !display.no_log {
        record_reply(config, reply);
    }
    Ok(())
}

fn record_reply(config: &Config, reply: &AssistantReply) {
    let trace_path = match (&config.logging.trace_dir, &reply.trace) {
        (Some(dir), Some(trace)) => match persist_trace(dir, &reply.request_id, trace.events()) {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                warn!(%err, "failed to persist trace");
                None
            }
        },
        _ => None,
    };

    if let Err(err) = log_request_completion(reply.log_input(trace_path)) {
        warn!(%err, request_id = %reply.request_id, "failed to append request log");
    }
}

fn eval_command(args: EvalArgs) -> Result<()> {
    let seed = EvaluationMetrics::with_keywords(args.keywords);
    let metrics = match args.file {
        Some(path) => EvaluationHarness::analyze_log_into(&path, seed)?,
        None => {
            EvaluationHarness::analyze_dir_into(args.log_dir.unwrap_or_else(log_base_dir), seed)?
        }
    };

    if args.json {
        let mut report = serde_json::to_value(&metrics)?;
        if let (Some(accuracy), Some(map)) = (metrics.keyword_accuracy(), report.as_object_mut()) {
            map.insert("keyword_accuracy".into(), serde_json::json!(accuracy));
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", metrics.summary());
    if !metrics.non_compliant.is_empty() {
        println!("non-compliant requests: {}", metrics.non_compliant.join(", "));
    }
    Ok(())
}
