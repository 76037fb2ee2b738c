//! 交互控制
//!
//! 从标准输入逐行读取命令：
//! - `set <CH> <SPEC>`：设置声道参数（声道从 1 开始）
//! - `reset`：所有声道相位归零
//! - `rate`：打印协商后的采样率
//! - `quit`：关闭引擎，会话随之结束
//!
//! EOF 和 `quit` 效果相同

use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};

use crate::engine::{ChannelParams, Command, EngineError, EngineHandle, ParamsError};

/// 一行解析出的命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// 转发给引擎
    Engine(Command),
    Rate,
    Quit,
}

/// 命令解析错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command '{0}' (expected set, reset, rate, quit)")]
    Unknown(String),

    #[error("usage: set <CH> <SHAPE[,FREQ[,AMP_DB[,PHASE_DEG]]]>")]
    Usage,

    #[error("invalid channel '{0}' (channels start at 1)")]
    InvalidChannel(String),

    #[error(transparent)]
    Params(#[from] ParamsError),
}

/// 解析一行命令
pub fn parse_line(line: &str) -> Result<ControlCommand, ParseError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Err(ParseError::Usage);
    };

    match name.to_ascii_lowercase().as_str() {
        "set" => {
            let (Some(channel), Some(spec), None) = (words.next(), words.next(), words.next())
            else {
                return Err(ParseError::Usage);
            };
            let index = channel
                .parse::<usize>()
                .ok()
                .and_then(|ch| ch.checked_sub(1))
                .ok_or_else(|| ParseError::InvalidChannel(channel.to_string()))?;
            let params: ChannelParams = spec.parse()?;
            Ok(ControlCommand::Engine(Command::SetParams(index, params)))
        }
        "reset" => Ok(ControlCommand::Engine(Command::Reset)),
        "rate" => Ok(ControlCommand::Rate),
        "quit" | "exit" | "q" => Ok(ControlCommand::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// 命令循环，直到 EOF、`quit` 或引擎已关闭
///
/// 错误的输入只打印提示，不会中断循环
pub fn run<R: BufRead, W: Write>(
    input: R,
    mut out: W,
    handle: &mut EngineHandle,
    channels: usize,
) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(e) => {
                writeln!(out, "error: {}", e)?;
                continue;
            }
        };

        match command {
            ControlCommand::Quit => break,
            ControlCommand::Rate => match handle.sample_rate() {
                Some(rate) => writeln!(out, "{} Hz", rate)?,
                None => writeln!(out, "stream not running yet")?,
            },
            ControlCommand::Engine(Command::SetParams(ch, _)) if ch >= channels => {
                writeln!(
                    out,
                    "error: channel {} out of range (1-{})",
                    ch + 1,
                    channels
                )?;
            }
            ControlCommand::Engine(command) => match handle.send(command) {
                Ok(()) => match command {
                    Command::SetParams(ch, params) => writeln!(out, "channel {}: {}", ch + 1, params)?,
                    Command::Reset => writeln!(out, "phase reset")?,
                },
                Err(EngineError::Closed) => break,
                Err(e) => writeln!(out, "error: {}", e)?,
            },
        }
        out.flush()?;
    }
    Ok(())
}

/// 在后台线程读取标准输入
///
/// 线程结束时 handle 被释放，引擎随之关闭
pub fn spawn_stdin(mut handle: EngineHandle, channels: usize) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            if let Err(e) = run(stdin.lock(), io::stdout(), &mut handle, channels) {
                log::warn!("Control input failed: {}", e);
            }
            log::info!("Control input closed, stopping engine");
        })
}
