use std::io::Write;

use colored::Colorize;

/// One progress update posted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusFrame {
    Banner(String),
    /// Baseline latency and the derived oracle cutoff.
    TargetTiming { reference_ms: f64, sleep_ms: f64 },
    /// A long-running step: `current` out of `total` (unknown when `None`).
    Progress {
        message: String,
        current: usize,
        total: Option<usize>,
    },
    /// Verdict for one tested parameter.
    ParamVerdict { param: String, exploitable: bool },
    /// A row landed in the dump file.
    RowFetched {
        formatted: String,
        fetched: usize,
        total: Option<usize>,
    },
    /// Advisory time estimate.
    Eta(String),
    Message(String),
}

/// Where progress frames go. Sinks are best-effort: implementations swallow
/// their own failures, the engine never sees them.
pub trait StatusSink: Send + Sync {
    fn log(&self, frame: StatusFrame);
    /// Clears any previous output.
    fn reset(&self);
    /// Flushes and stops the sink; frames logged afterwards are ignored.
    fn end(&self);
}

/// Plain line-per-frame console sink.
pub struct ConsoleSink;

impl StatusSink for ConsoleSink {
    fn log(&self, frame: StatusFrame) {
        match frame {
            StatusFrame::Banner(banner) => println!("{}", banner.bright_blue()),
            StatusFrame::TargetTiming {
                reference_ms,
                sleep_ms,
            } => {
                println!(
                    "{} Target response time: {}",
                    "→".blue(),
                    format!("{:.2} ms ({:.3} sec)", reference_ms, reference_ms / 1000.0).yellow()
                );
                println!(
                    "{} Injected sleep time:  {}",
                    "→".blue(),
                    format!("{:.2} ms ({:.3} sec)", sleep_ms, sleep_ms / 1000.0).yellow()
                );
            }
            StatusFrame::Progress {
                message,
                current,
                total,
            } => match total {
                Some(total) => println!(
                    "{} [{}/{}] {}",
                    "→".blue(),
                    current,
                    total,
                    message.bright_white()
                ),
                None => println!("{} [{}] {}", "→".blue(), current, message.bright_white()),
            },
            StatusFrame::ParamVerdict { param, exploitable } => {
                if exploitable {
                    println!(
                        "{} '{}' seems to be exploitable",
                        "✓".green(),
                        param.yellow()
                    );
                } else {
                    println!(
                        "{} '{}' doesn't seem to be exploitable",
                        "✗".red(),
                        param.yellow()
                    );
                }
            }
            StatusFrame::RowFetched {
                formatted,
                fetched,
                total,
            } => {
                let progress = match total {
                    Some(total) => format!("Fetched {}/{} rows.", fetched, total),
                    None => format!("Fetched {}/- rows.", fetched),
                };
                if formatted.is_empty() {
                    println!("{} {} Last row was empty.", "•".green(), progress.bright_black());
                } else {
                    println!(
                        "{} {} Last row: {}",
                        "•".green(),
                        progress.bright_black(),
                        formatted.bright_white()
                    );
                }
            }
            StatusFrame::Eta(message) => println!("{} {}", "…".bright_black(), message.bright_black()),
            StatusFrame::Message(message) => println!("{}", message),
        }
    }

    fn reset(&self) {
        println!();
    }

    fn end(&self) {
        let _ = std::io::stdout().flush();
    }
}
