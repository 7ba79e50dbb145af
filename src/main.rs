use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use reelcast::config::{
    resolve_path_override, resolve_secs_override, ConfigOverrides, RenderConfig, RenderMode,
    ENV_FFMPEG, ENV_FONT, ENV_JOB_TIMEOUT_SECS, ENV_TEMP_DIR,
};
use reelcast::error::{RenderError, RenderResult};
use reelcast::job::{render_still_png, validate_job, RenderJob, RenderProgress, RenderStage};
use reelcast::logging::init_logging;
use reelcast::narration::split_narration;
use reelcast::request::{RenderRequest, TemplateKind};
use reelcast::timeline::Schedule;

#[derive(Debug, Parser)]
#[command(name = "reelcast")]
#[command(about = "Composite grid and news shorts from source clips")]
#[command(version = env!("REELCAST_VERSION"))]
struct Cli {
    /// Render config (YAML or JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print results and failures as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// ffmpeg binary (env: REELCAST_FFMPEG).
    #[arg(long, global = true)]
    ffmpeg: Option<PathBuf>,
    /// Body font file (env: REELCAST_FONT).
    #[arg(long, global = true)]
    font: Option<PathBuf>,
    /// Root for per-job temp directories (env: REELCAST_TEMP_DIR).
    #[arg(long = "temp-dir", global = true)]
    temp_dir: Option<PathBuf>,
    /// Job wall-clock budget in seconds (env: REELCAST_JOB_TIMEOUT_SECS).
    #[arg(long, global = true)]
    timeout: Option<f64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render a request to an MP4 file.
    Render {
        request: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Force a render mode for this job's template.
        #[arg(long)]
        mode: Option<RenderMode>,
    },
    /// Validate a request without rendering.
    Check { request: PathBuf },
    /// Print the frame schedule for a template.
    Schedule {
        template: TemplateKind,
        #[arg(long, value_enum, default_value_t = ScheduleFormat::Table)]
        format: ScheduleFormat,
    },
    /// Split narration text into balanced blocks, one per ticker.
    SplitNarration {
        /// Text file, or `-` for stdin.
        input: PathBuf,
        #[arg(long)]
        parts: Option<usize>,
    },
    /// Render the single frame at `--at` seconds to a PNG.
    Still {
        request: PathBuf,
        #[arg(long = "at", default_value_t = 0.0)]
        at: f64,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScheduleFormat {
    /// One JSON object per frame.
    Jsonl,
    /// One row per second.
    Table,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let report = error.report();
            if json {
                eprintln!("{}", report.to_json());
            } else {
                eprintln!("{}", report.human());
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> RenderResult<RenderConfig> {
    let config = match &cli.config {
        Some(path) => RenderConfig::load(path),
        None => Ok(RenderConfig::default()),
    }
    .map_err(|error| RenderError::validation(format!("{error:#}")))?;

    let overrides = ConfigOverrides {
        ffmpeg_path: resolve_path_override(cli.ffmpeg.clone(), std::env::var(ENV_FFMPEG).ok()),
        font: resolve_path_override(cli.font.clone(), std::env::var(ENV_FONT).ok()),
        temp_root: resolve_path_override(cli.temp_dir.clone(), std::env::var(ENV_TEMP_DIR).ok()),
        job_timeout_secs: resolve_secs_override(
            cli.timeout,
            std::env::var(ENV_JOB_TIMEOUT_SECS).ok(),
        )
        .map_err(|error| RenderError::validation(format!("{error:#}")))?,
        ..ConfigOverrides::default()
    };
    config
        .with_overrides(&overrides)
        .map_err(|error| RenderError::validation(format!("{error:#}")))
}

fn load_request(path: &Path) -> RenderResult<RenderRequest> {
    RenderRequest::load(path).map_err(|error| RenderError::validation(format!("{error:#}")))
}

async fn run(cli: Cli) -> RenderResult<()> {
    let mut config = load_config(&cli)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Render {
            request,
            output,
            mode,
        } => {
            let request = load_request(&request)?;
            if let Some(mode) = mode {
                match request.template {
                    TemplateKind::Grid4 => config.modes.grid4 = mode,
                    TemplateKind::NewsSequence => config.modes.news_sequence = mode,
                }
            }
            run_render(config, request, &output, cli.json).await
        }
        Commands::Check { request } => run_check(&config, &request, cli.json),
        Commands::Schedule { template, format } => run_schedule(&config, template, format),
        Commands::SplitNarration { input, parts } => {
            run_split_narration(&input, parts.unwrap_or(config.timing.ticker_count), cli.json)
        }
        Commands::Still {
            request,
            at,
            output,
        } => {
            let request = load_request(&request)?;
            render_still_png(Arc::new(config), request, at, &output).await?;
            println!("Wrote {}", output.display());
            Ok(())
        }
    }
}

async fn run_render(
    config: RenderConfig,
    request: RenderRequest,
    output: &Path,
    json: bool,
) -> RenderResult<()> {
    let job = RenderJob::new(Arc::new(config), request, output).with_progress(Arc::new(
        |progress: RenderProgress| {
            if progress.stage != RenderStage::Rendering {
                tracing::info!(stage = ?progress.stage, fraction = progress.fraction, "progress");
            } else {
                tracing::debug!(fraction = progress.fraction, "progress");
            }
        },
    ));
    let outcome = job.run().await?;
    if json {
        let line = serde_json::to_string(&outcome).map_err(|error| RenderError::Other(error.into()))?;
        println!("{line}");
    } else {
        println!(
            "Wrote {} ({} frames, {:.1}s, {:?} mode, {} degraded frames)",
            outcome.output.display(),
            outcome.frames,
            outcome.duration_secs,
            outcome.mode,
            outcome.diagnostics.frame_failures
        );
    }
    Ok(())
}

fn run_check(config: &RenderConfig, request_path: &Path, json: bool) -> RenderResult<()> {
    let request = load_request(request_path)?;
    validate_job(config, &request)?;
    let schedule = Schedule::new(request.template, &config.timing, config.canvas.fps);
    let mode = config.modes.for_template(request.template);
    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "template": request.template.as_str(),
                "mode": mode,
                "frames": schedule.frame_count(),
                "duration_secs": schedule.total_duration(),
            })
        );
    } else {
        println!(
            "OK: {} ({}, {:?} mode, {}x{} @ {} fps, {} frames, {:.1}s)",
            request_path.display(),
            request.template.as_str(),
            mode,
            config.canvas.width,
            config.canvas.height,
            config.canvas.fps,
            schedule.frame_count(),
            schedule.total_duration()
        );
    }
    Ok(())
}

fn run_schedule(config: &RenderConfig, template: TemplateKind, format: ScheduleFormat) -> RenderResult<()> {
    let schedule = Schedule::new(template, &config.timing, config.canvas.fps);
    match format {
        ScheduleFormat::Jsonl => {
            for state in schedule.frames() {
                let line = serde_json::to_string(&state).map_err(|error| RenderError::Other(error.into()))?;
                println!("{line}");
            }
        }
        ScheduleFormat::Table => {
            println!("{:>6}  {:<8}  {:>4}  {:>6}  {:>5}", "t", "phase", "clip", "ticker", "alpha");
            let fps = u64::from(schedule.fps());
            let seconds = schedule.total_duration().ceil() as u64;
            for second in 0..seconds {
                let state = schedule.frame_state(second * fps);
                let clip = state.active_clip.map_or("-".to_owned(), |index| index.to_string());
                let (ticker, alpha) = match state.ticker {
                    Some(ticker) => (ticker.index.to_string(), format!("{:.2}", ticker.alpha)),
                    None => ("-".to_owned(), "-".to_owned()),
                };
                println!(
                    "{:>6.2}  {:<8}  {:>4}  {:>6}  {:>5}",
                    state.t,
                    state.phase.as_str(),
                    clip, ticker, alpha
                );
            }
        }
    }
    Ok(())
}

fn run_split_narration(input: &Path, parts: usize, json: bool) -> RenderResult<()> {
    let text = if input == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(input)?
    };
    let blocks = split_narration(&text, parts);
    if json {
        let line = serde_json::to_string(&blocks).map_err(|error| RenderError::Other(error.into()))?;
        println!("{line}");
    } else {
        for block in blocks {
            println!("{block}");
        }
    }
    Ok(())
}
