use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};
use ptyhost_common::types::{ExitStatus, Size};
use ptyhost_core::{Args, Terminal, TerminalOptions};
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a command on a pseudoterminal", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Terminal columns (defaults to the current terminal size)
    #[arg(long)]
    cols: Option<u16>,

    /// Terminal rows (defaults to the current terminal size)
    #[arg(long)]
    rows: Option<u16>,

    /// Working directory of the child
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the child, as KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Terminal name exported as TERM
    #[arg(long)]
    name: Option<String>,

    /// Watch the output for pause/resume markers
    #[arg(long)]
    flow_control: bool,

    /// Pause marker used with --flow-control
    #[arg(long, requires = "flow_control")]
    pause: Option<String>,

    /// Resume marker used with --flow-control
    #[arg(long, requires = "flow_control")]
    resume: Option<String>,

    /// JSON file with terminal options; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Program to run (defaults to the user's shell)
    program: Option<String>,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Input forwarded from the controlling terminal
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Bytes(Vec<u8>),
    Resize(u16, u16),
}

/// Restores the controlling terminal when dropped.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            error!("Failed to restore terminal: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "ptyhost=debug"
    } else {
        "ptyhost=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let options = load_options(&cli)?;
    let program = cli.program.clone().unwrap_or_default();
    info!("Starting {} at {}", if program.is_empty() { "default shell" } else { program.as_str() }, options.size);

    let terminal = ptyhost_core::spawn(&program, Args::Argv(cli.args.clone()), options)
        .context("Failed to spawn program")?;

    let interactive = io::stdin().is_terminal();
    let status = {
        let _raw = if interactive { Some(RawMode::enable()?) } else { None };
        bridge(&terminal, interactive).await?
    };

    info!(%status, "Child exited");
    std::process::exit(exit_code(status));
}

fn load_options(cli: &Cli) -> Result<TerminalOptions> {
    let (mut options, sized) = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            let sized = value.get("cols").is_some() || value.get("rows").is_some();
            (TerminalOptions::from_json(&value)?, sized)
        }
        None => (TerminalOptions::default(), false),
    };

    if !sized {
        match terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => options.size = Size::new(cols, rows),
            _ => debug!("No controlling terminal size, using {}", options.size),
        }
    }
    if let Some(cols) = cli.cols {
        options.size.cols = cols;
    }
    if let Some(rows) = cli.rows {
        options.size.rows = rows;
    }
    if let Some(name) = &cli.name {
        options.name = Some(name.clone());
    }
    if let Some(cwd) = &cli.cwd {
        options.cwd = Some(cwd.clone());
    }
    if !cli.env.is_empty() {
        let mut env = options.resolved_env();
        env.extend(cli.env.iter().cloned());
        options.env = Some(env);
    }
    if cli.flow_control {
        options.flow_control.enabled = true;
        if let Some(pause) = &cli.pause {
            options.flow_control.pause = pause.as_bytes().to_vec();
        }
        if let Some(resume) = &cli.resume {
            options.flow_control.resume = resume.as_bytes().to_vec();
        }
    }

    options.validate()?;
    Ok(options)
}

/// Shuttle bytes between the controlling terminal and the child until it exits.
async fn bridge(terminal: &Terminal, interactive: bool) -> Result<ExitStatus> {
    let mut data = terminal.on_data();
    let mut errors = terminal.on_error();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    if interactive {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = read_input(input_tx) {
                error!("Input handler failed: {}", e);
            }
        });
    }

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            chunk = data.recv() => match chunk {
                Some(chunk) => {
                    stdout.write_all(&chunk)?;
                    stdout.flush()?;
                }
                None => break,
            },
            Some(notice) = errors.recv() => {
                error!("Terminal error: {}", notice);
                notice.acknowledge();
            }
            Some(input) = input_rx.recv() => match input {
                Input::Bytes(bytes) => {
                    if terminal.write(bytes).is_err() {
                        debug!("Dropping input for a closed terminal");
                    }
                }
                Input::Resize(cols, rows) => {
                    if let Err(e) = terminal.resize(cols, rows) {
                        warn!("Ignoring resize to {}x{}: {}", cols, rows, e);
                    }
                }
            },
        }
    }

    Ok(terminal.wait().await?)
}

fn read_input(tx: mpsc::UnboundedSender<Input>) -> Result<()> {
    debug!("Input handler started");
    while !tx.is_closed() {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let input = match event::read()? {
            Event::Key(key) => key_bytes(key).map(Input::Bytes),
            Event::Paste(text) => Some(Input::Bytes(text.into_bytes())),
            Event::Resize(cols, rows) => Some(Input::Resize(cols, rows)),
            _ => None,
        };
        if let Some(input) = input {
            if tx.send(input).is_err() {
                break;
            }
        }
    }
    debug!("Input handler exiting");
    Ok(())
}

/// Bytes a VT-style terminal would send for `key`.
fn key_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    let mut bytes = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            match c.to_ascii_lowercase() {
                c @ 'a'..='z' => vec![c as u8 & 0x1f],
                ' ' | '@' | '2' => vec![0x00],
                '[' | '3' => vec![0x1b],
                '\\' | '4' => vec![0x1c],
                ']' | '5' => vec![0x1d],
                _ => return None,
            }
        }
        KeyCode::Char(c) => c.to_string().into_bytes(),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        _ => return None,
    };
    if key.modifiers.contains(KeyModifiers::ALT) {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

/// Shell convention: 128 + signal for a child killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    match status.signal {
        Some(signal) => 128 + signal,
        None => status.code,
    }
}
