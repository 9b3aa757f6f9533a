use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvError, Sender};
use std::collections::VecDeque;
use std::io::{self, BufRead, IsTerminal};
use std::sync::Arc;
use std::thread;

use reqscore::cli::{Cli, StatsFormat};
use reqscore::config::ServiceConfig;
use reqscore::decompression;
use reqscore::drain::format_templates_output;
use reqscore::error_handling::{ConfigError, FailureTally};
use reqscore::model::PatternModel;
use reqscore::platform::{Ctrl, ExitCode, SafeStdout, SignalHandler};
use reqscore::record::RawLine;
use reqscore::service::{PendingScore, ScoringService};
use reqscore::stats::format_stats;

const LINE_CHANNEL_BOUND: usize = 10_000;
const IO_FAILURE: &str = "io";

/// Messages sent from the reader thread to the scoring loop
enum ReaderMessage {
    Line(RawLine),
    Error { error: anyhow::Error, source: String },
    Eof,
}

/// Initialize the stderr subscriber. RUST_LOG wins over -v/-q.
fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .try_init();
}

fn input_sources(files: &[String]) -> Vec<String> {
    if files.is_empty() {
        vec!["-".to_string()]
    } else {
        files.to_vec()
    }
}

fn display_source(source: &str) -> &str {
    if source == "-" {
        "<stdin>"
    } else {
        source
    }
}

fn spawn_reader(sources: Vec<String>, sender: Sender<ReaderMessage>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        'sources: for source in sources {
            let mut reader = match decompression::open_input(&source) {
                Ok(reader) => reader,
                Err(error) => {
                    if sender.send(ReaderMessage::Error { error, source }).is_err() {
                        return;
                    }
                    continue;
                }
            };
            let label = display_source(&source).to_string();

            loop {
                if SignalHandler::should_terminate() {
                    break 'sources;
                }

                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {
                        // Invalid UTF-8 is replaced, the line still goes to the parser
                        let text = String::from_utf8_lossy(&buffer);
                        let text = text.trim_end_matches(&['\n', '\r'][..]);
                        let raw = RawLine::new(text, Some(label.clone()));
                        if sender.send(ReaderMessage::Line(raw)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let message = ReaderMessage::Error {
                            error: anyhow::Error::new(e).context(format!("Failed to read {}", label)),
                            source: source.clone(),
                        };
                        let _ = sender.send(message);
                        // A decoder error leaves the stream unusable
                        break;
                    }
                }
            }
        }
        let _ = sender.send(ReaderMessage::Eof);
    })
}

/// Submits lines and prints responses in input order.
///
/// At most `window` requests are outstanding, which keeps the scheduler queue
/// below its capacity while still letting consecutive lines share batches.
struct ScoringLoop<'a> {
    service: &'a ScoringService,
    pending: VecDeque<(PendingScore, String)>,
    window: usize,
    stdout: SafeStdout,
    quiet: bool,
    failures: FailureTally,
    current_source: String,
    line_num: usize,
}

impl<'a> ScoringLoop<'a> {
    fn new(service: &'a ScoringService, quiet: bool) -> Self {
        let scheduler = &service.config().scheduler;
        let window = (scheduler.max_batch_size * scheduler.dispatch_workers * 2)
            .min(scheduler.queue_capacity)
            .max(1);

        Self {
            service,
            pending: VecDeque::with_capacity(window),
            window,
            stdout: SafeStdout::new(),
            quiet,
            failures: FailureTally::new(),
            current_source: String::new(),
            line_num: 0,
        }
    }

    fn submit(&mut self, raw: &RawLine) -> Result<()> {
        let source = raw.source.as_deref().unwrap_or("-");
        if source != self.current_source {
            self.current_source = source.to_string();
            self.line_num = 0;
        }
        self.line_num += 1;
        if raw.text.trim().is_empty() {
            return Ok(());
        }

        while self.pending.len() >= self.window {
            self.emit_oldest()?;
        }

        let location = format!("{}:{}", source, self.line_num);
        match self.service.submit_raw(raw) {
            Ok(pending) => self.pending.push_back((pending, location)),
            Err(e) => {
                tracing::debug!(%location, error = %e, "line not submitted");
                self.failures.record_error(&e, &location);
            }
        }

        self.emit_ready()
    }

    fn emit_oldest(&mut self) -> Result<()> {
        let Some((pending, location)) = self.pending.pop_front() else {
            return Ok(());
        };

        match pending.wait() {
            Ok(response) => {
                if !self.quiet {
                    self.stdout.writeln(&serde_json::to_string(&response)?)?;
                }
            }
            Err(e) => {
                tracing::warn!(%location, error = %e, "request was not scored");
                self.failures.record_error(&e, &location);
            }
        }
        Ok(())
    }

    /// Print every finished response at the head of the queue
    fn emit_ready(&mut self) -> Result<()> {
        while self
            .pending
            .front()
            .is_some_and(|(pending, _)| pending.is_ready())
        {
            self.emit_oldest()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            self.emit_oldest()?;
        }
        self.stdout.flush()
    }

    /// Returns how the run ended once the message stops it
    fn handle_ctrl(&mut self, msg: Result<Ctrl, RecvError>) -> Option<LoopEnd> {
        match msg {
            Ok(Ctrl::Shutdown) | Err(_) => Some(LoopEnd::Interrupted),
            Ok(Ctrl::PrintStats) => {
                eprintln!("{}", format_stats(&self.service.stats()));
                None
            }
        }
    }

    fn handle_reader(&mut self, msg: Result<ReaderMessage, RecvError>) -> Result<Option<LoopEnd>> {
        match msg {
            Ok(ReaderMessage::Line(raw)) => self.submit(&raw)?,
            Ok(ReaderMessage::Error { error, source }) => {
                tracing::error!(source = display_source(&source), "{:#}", error);
                self.failures.record(IO_FAILURE, format!("{:#}", error));
            }
            Ok(ReaderMessage::Eof) | Err(_) => return Ok(Some(LoopEnd::Finished)),
        }
        Ok(None)
    }
}

enum LoopEnd {
    Finished,
    Interrupted,
}

fn run(service: &ScoringService, cli: &Cli, ctrl_rx: &Receiver<Ctrl>) -> Result<(LoopEnd, FailureTally)> {
    let (line_tx, line_rx) = bounded::<ReaderMessage>(LINE_CHANNEL_BOUND);
    let _reader = spawn_reader(input_sources(&cli.files), line_tx);

    let mut scoring = ScoringLoop::new(service, cli.quiet);
    let idle = service.config().scheduler.batch_timeout;

    let end = loop {
        let step = if scoring.pending.is_empty() {
            select! {
                recv(ctrl_rx) -> msg => scoring.handle_ctrl(msg),
                recv(line_rx) -> msg => scoring.handle_reader(msg)?,
            }
        } else {
            select! {
                recv(ctrl_rx) -> msg => scoring.handle_ctrl(msg),
                recv(line_rx) -> msg => scoring.handle_reader(msg)?,
                // Input went quiet; flush what is outstanding so tailed logs keep flowing
                default(idle) => {
                    scoring.drain()?;
                    None
                }
            }
        };
        if let Some(end) = step {
            break end;
        }
    };

    scoring.drain()?;
    Ok((end, scoring.failures))
}

fn print_reports(service: &ScoringService, cli: &Cli, failures: &FailureTally) {
    if let Some(summary) = failures.summary() {
        let (accepted, rejected) = service.line_counts();
        eprintln!(
            "reqscore: {} lines accepted, {} lines could not be parsed",
            accepted, rejected
        );
        eprintln!("{}", summary);
    }

    if cli.templates {
        eprintln!("{}", format_templates_output(&service.templates()));
    }

    match cli.stats {
        Some(StatsFormat::Table) => eprintln!("{}", format_stats(&service.stats())),
        Some(StatsFormat::Json) => match serde_json::to_string_pretty(&service.stats()) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => tracing::error!("Failed to serialize stats: {}", e),
        },
        None => {}
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = ServiceConfig::from_cli(&cli);
    if let Err(e) = config.validate() {
        eprintln!("reqscore: Error: {}", e);
        ExitCode::InvalidUsage.exit();
    }

    let (ctrl_tx, ctrl_rx) = unbounded::<Ctrl>();
    let _signal_handler = match SignalHandler::new(ctrl_tx) {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("reqscore: Failed to initialize signal handling: {}", e);
            ExitCode::GeneralError.exit();
        }
    };

    let service = match ScoringService::new(config, Arc::new(PatternModel::new())) {
        Ok(service) => service,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            eprintln!("reqscore: Error: {}", e);
            ExitCode::InvalidUsage.exit();
        }
        Err(e) => {
            eprintln!("reqscore: Error: {:#}", e);
            ExitCode::GeneralError.exit();
        }
    };

    let outcome = run(&service, &cli, &ctrl_rx);
    service.shutdown();

    let (end, failures) = match outcome {
        Ok(result) => result,
        Err(e) => {
            eprintln!("reqscore: Error: {:#}", e);
            ExitCode::GeneralError.exit();
        }
    };

    print_reports(&service, &cli, &failures);

    match end {
        LoopEnd::Interrupted => SignalHandler::termination_code()
            .unwrap_or(ExitCode::SignalInt)
            .exit(),
        LoopEnd::Finished if failures.count(IO_FAILURE) > 0 => ExitCode::GeneralError.exit(),
        LoopEnd::Finished => ExitCode::Success.exit(),
    }
}
