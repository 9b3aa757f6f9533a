//! Process-level plumbing for the CLI: exit codes, signals and a pipe-safe stdout

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use std::io::{self, BufWriter, Stdout, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;

#[cfg(unix)]
use signal_hook::consts::{SIGINT, SIGPIPE, SIGTERM, SIGUSR1};
#[cfg(unix)]
use signal_hook::iterator::Signals;

/// Process exit statuses; signal exits follow the 128 + signo convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidUsage = 2,
    SignalInt = 130,
    SignalPipe = 141,
    SignalTerm = 143,
}

impl ExitCode {
    pub fn exit(self) -> ! {
        std::process::exit(self as i32)
    }

    fn from_status(status: u8) -> Option<Self> {
        match status {
            130 => Some(ExitCode::SignalInt),
            141 => Some(ExitCode::SignalPipe),
            143 => Some(ExitCode::SignalTerm),
            _ => None,
        }
    }
}

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
/// Status of the first terminating signal, 0 while none arrived
static TERMINATION_STATUS: AtomicU8 = AtomicU8::new(0);

/// Requests from the signal thread to the scoring loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ctrl {
    /// Stop reading input and drain what is in flight
    Shutdown,
    PrintStats,
}

/// Tracks repeated shutdown signals: the first drains, the second exits at once
struct ShutdownLatch {
    received: u32,
    ctrl_sender: Sender<Ctrl>,
}

impl ShutdownLatch {
    fn new(ctrl_sender: Sender<Ctrl>) -> Self {
        Self {
            received: 0,
            ctrl_sender,
        }
    }

    fn trigger(&mut self, code: ExitCode) {
        TERMINATE_REQUESTED.store(true, Ordering::Relaxed);
        let _ = TERMINATION_STATUS.compare_exchange(
            0,
            code as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );

        self.received += 1;
        if self.received > 1 {
            code.exit();
        }
        tracing::warn!(status = code as i32, "shutdown requested, draining pending requests");
        let _ = self.ctrl_sender.send(Ctrl::Shutdown);
    }
}

/// Owns the background thread that turns OS signals into [`Ctrl`] messages
pub struct SignalHandler {
    _thread: thread::JoinHandle<()>,
}

impl SignalHandler {
    #[cfg(unix)]
    pub fn new(ctrl_sender: Sender<Ctrl>) -> Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGPIPE, SIGUSR1])?;
        let thread = thread::Builder::new()
            .name("reqscore-signals".to_string())
            .spawn(move || {
                let mut latch = ShutdownLatch::new(ctrl_sender.clone());
                for signal in signals.forever() {
                    match signal {
                        SIGINT => latch.trigger(ExitCode::SignalInt),
                        SIGTERM => latch.trigger(ExitCode::SignalTerm),
                        // Reader went away; nothing left to write to
                        SIGPIPE => ExitCode::SignalPipe.exit(),
                        SIGUSR1 => {
                            let _ = ctrl_sender.send(Ctrl::PrintStats);
                        }
                        _ => {}
                    }
                }
            })?;
        Ok(Self { _thread: thread })
    }

    #[cfg(windows)]
    pub fn new(ctrl_sender: Sender<Ctrl>) -> Result<Self> {
        use std::sync::Arc;
        use std::time::Duration;

        let interrupted = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;
        let thread = thread::Builder::new()
            .name("reqscore-signals".to_string())
            .spawn(move || {
                let mut latch = ShutdownLatch::new(ctrl_sender);
                loop {
                    thread::sleep(Duration::from_millis(100));
                    if interrupted.swap(false, Ordering::Relaxed) {
                        latch.trigger(ExitCode::SignalInt);
                    }
                }
            })?;
        Ok(Self { _thread: thread })
    }

    /// Whether a shutdown signal has been received
    pub fn should_terminate() -> bool {
        TERMINATE_REQUESTED.load(Ordering::Relaxed)
    }

    /// Exit code for the signal that stopped processing
    pub fn termination_code() -> Option<ExitCode> {
        ExitCode::from_status(TERMINATION_STATUS.load(Ordering::Relaxed))
    }
}

/// Buffered stdout where a closed pipe ends the process with status 141
/// instead of surfacing as an error
pub struct SafeStdout {
    inner: BufWriter<Stdout>,
}

impl Default for SafeStdout {
    fn default() -> Self {
        Self::new()
    }
}

fn is_broken_pipe(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::BrokenPipe {
        return true;
    }
    // ERROR_BROKEN_PIPE and ERROR_NO_DATA
    cfg!(windows) && matches!(err.raw_os_error(), Some(109) | Some(232))
}

fn check_write(result: io::Result<()>, action: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_broken_pipe(&err) => ExitCode::SignalPipe.exit(),
        Err(err) => Err(anyhow!("Failed to {} stdout: {}", action, err)),
    }
}

impl SafeStdout {
    pub fn new() -> Self {
        Self {
            inner: BufWriter::new(io::stdout()),
        }
    }

    pub fn writeln(&mut self, line: &str) -> Result<()> {
        check_write(writeln!(self.inner, "{}", line), "write to")
    }

    pub fn flush(&mut self) -> Result<()> {
        check_write(self.inner.flush(), "flush")
    }
}
