mod app;
mod dispatcher;
mod input;
mod logging;
mod registry;
mod shutdown;
mod state;
mod throttle;
mod ws;

use clap::Parser;
use skywave_core::config::Config;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "skywave-server", about = "Web SDR demodulation and streaming server")]
struct Args {
    /// JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Debug-level logging for the skywave crates.
    #[arg(long)]
    debug: bool,
    /// Also write daily-rolling log files into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = skywave_core::config::load(&args.config)?;
    let _guards = logging::init(&logging::LoggingConfig {
        debug: args.debug,
        log_dir: args.log_dir,
        ..Default::default()
    })?;

    // Worker pool sized to hardware concurrency unless pinned in config;
    // the same bound applies to the blocking pool running per-subscriber
    // DSP tasks.
    let threads = if cfg.server.threads > 0 {
        cfg.server.threads
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .max_blocking_threads(threads)
        .enable_all()
        .build()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let rt = cfg.runtime()?;
    tracing::info!(
        sps = rt.sps,
        fft_size = rt.fft_size,
        audio_sps = rt.audio_max_sps,
        audio_fft = rt.audio_max_fft_size,
        levels = rt.downsample_levels,
        "runtime configured"
    );

    let state = state::AppState::new(cfg, rt);

    // Shallow frame queue: the producer paces itself against the
    // dispatcher's per-frame barrier instead of building a backlog.
    let (frames_tx, frames_rx) = tokio::sync::mpsc::channel(2);
    input::spawn_stdin_input(state.clone(), frames_tx);
    tokio::spawn(dispatcher::run_audio(state.clone(), frames_rx));
    tokio::spawn(ws::events::run_ticker(state.clone()));

    app::serve(state).await
}
