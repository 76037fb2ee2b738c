//! Multisig - 多声道测试信号发生器
//!
//! 每个声道独立的波形 / 频率 / 幅度 / 初相，
//! 通过 PipeWire 低延迟输出流播放

use clap::Parser;

use multisig::engine::{ChannelParams, EngineConfig};

/// Multi-channel test signal generator
#[derive(Parser)]
#[command(name = "multisig")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Channel parameters SHAPE[,FREQ[,AMP_DB[,PHASE_DEG]]], repeat per channel
    /// (shapes: sine, triangle, square[:DUTY], saw)
    #[arg(short, long = "channel", value_name = "SPEC")]
    channels: Vec<ChannelParams>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<f64>,

    /// Stream node name
    #[arg(short, long, default_value = "multisig")]
    name: String,

    /// Media role reported to PipeWire
    #[arg(long, default_value = "Music")]
    role: String,

    /// Requested period size in frames
    #[arg(long, value_name = "FRAMES")]
    latency: Option<u32>,

    /// Frames preallocated by the engine
    #[arg(long, default_value = "8192")]
    max_frames: usize,

    /// Read control commands from stdin (set <CH> <SPEC>, reset, rate, quit)
    #[arg(short, long)]
    interactive: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    run(cli)
}

/// 帧数上限
fn frame_limit(duration: Option<f64>, sample_rate: u32) -> anyhow::Result<Option<u64>> {
    match duration {
        None => Ok(None),
        Some(secs) if secs.is_finite() && secs >= 0. => {
            Ok(Some((secs * sample_rate as f64).round() as u64))
        }
        Some(secs) => anyhow::bail!("invalid duration: {}", secs),
    }
}

/// 引擎配置
fn engine_config(cli: &Cli, channels: u16, sample_rate: u32) -> anyhow::Result<EngineConfig> {
    if cli.channels.len() > channels as usize {
        anyhow::bail!(
            "{} channel specs given, but the stream has {} channels",
            cli.channels.len(),
            channels
        );
    }
    if cli.max_frames == 0 {
        anyhow::bail!("--max-frames must be positive");
    }

    Ok(EngineConfig {
        channels,
        max_frames: cli.max_frames,
        params: cli.channels.clone(),
        frame_limit: frame_limit(cli.duration, sample_rate)?,
        ..Default::default()
    })
}

#[cfg(feature = "pipewire")]
fn run(cli: Cli) -> anyhow::Result<()> {
    use multisig::audio::{OutputConfig, PipeWireBackend, StopReason, StreamFormat, StreamSession};
    use multisig::engine::SignalEngine;

    let format = StreamFormat::default();
    let config = engine_config(&cli, format.channels, format.sample_rate)?;
    let (mut engine, handle) = SignalEngine::new(config);

    // 失败时引擎自己会打警告，没有 mlock 也能运行
    engine.lock_memory();

    for (i, params) in engine.channel_params().enumerate() {
        println!("  ch{}: {}", i + 1, params);
    }

    let stop_flag = handle.stop_flag();
    let stop = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop.stop();
    })?;

    // 控制端活着引擎才会继续渲染
    let _handle = if cli.interactive {
        println!("Commands: set <CH> <SPEC> | reset | rate | quit\n");
        multisig::control::spawn_stdin(handle, format.channels as usize)?;
        None
    } else {
        println!("Press Ctrl+C to stop.\n");
        Some(handle)
    };

    let backend = PipeWireBackend::new(OutputConfig {
        name: cli.name,
        media_role: cli.role,
        latency_frames: cli.latency,
    });

    let mut session = StreamSession::new(backend, engine, format).with_stop_flag(stop_flag);
    let report = session.run()?;

    println!("\n{}", report.stats);

    match report.reason {
        Some(StopReason::DeviceError) => anyhow::bail!("stream stopped on device error"),
        Some(StopReason::EndOfStream) | None => Ok(()),
    }
}

#[cfg(not(feature = "pipewire"))]
fn run(cli: Cli) -> anyhow::Result<()> {
    let _ = engine_config(&cli, 2, 44100)?;
    anyhow::bail!("built without PipeWire support (enable the `pipewire` feature)")
}
