//! Wave execution progress UI.
//!
//! Renders `EngineEvent`s in one of three modes:
//! - `full`: progress bars per in-flight unit, wave and phase headers
//! - `minimal`: one line per notable event
//! - `json`: one JSON object per event for machine consumption

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crate::orchestrator::{EngineEvent, RunOutcome, WorkerStatus};
use crate::ui::icons::{
    BLOCKER, CHECK, CLOCK, CROSS, GATE, PIVOT, REVIEW, RULING, RUNNING, SPARKLE, WAVE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Terminal UI for a stagehand run.
///
/// Events are handled sequentially from a single task; the mutex only guards
/// the per-unit bar map.
pub struct WaveUI {
    mode: UiMode,
    multi: MultiProgress,
    /// Overall unit progress
    header_bar: ProgressBar,
    unit_bars: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl WaveUI {
    pub fn new(total_units: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░");

        let header_bar = if mode == UiMode::Full {
            multi.add(ProgressBar::new(total_units as u64))
        } else {
            ProgressBar::hidden()
        };
        header_bar.set_style(header_style);
        header_bar.set_prefix("units");
        header_bar.set_message("Starting...");

        Self {
            mode,
            multi,
            header_bar,
            unit_bars: Mutex::new(HashMap::new()),
            verbose,
            term: Term::stdout(),
        }
    }

    /// Account for units already verified by an earlier run.
    pub fn set_verified(&self, count: usize) {
        self.header_bar.set_position(count as u64);
    }

    pub fn handle_event(&self, event: &EngineEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &EngineEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &EngineEvent) {
        let line = match event {
            EngineEvent::PhaseStarted { phase } => format!("Phase {}", phase),
            EngineEvent::WaveStarted { phase, wave, units } => {
                format!("Wave {}/{}: {}", phase, wave, units.join(", "))
            }
            EngineEvent::UnitVerified { unit, .. } => format!("✓ {}", unit),
            EngineEvent::UnitFailed { unit, error, .. } => format!("✗ {} ({})", unit, error),
            EngineEvent::WaveCompleted {
                phase,
                wave,
                verified,
                failed,
            } => format!(
                "Wave {}/{} done: {} verified, {} failed",
                phase, wave, verified, failed
            ),
            EngineEvent::PhaseAwaitingApproval { phase } => {
                format!("Phase {} awaiting approval", phase)
            }
            EngineEvent::PhaseApproved { phase } => format!("Phase {} approved", phase),
            EngineEvent::PhaseRejected { phase, comments } => {
                format!("Phase {} rejected: {}", phase, comments)
            }
            EngineEvent::PhaseBlocked {
                phase,
                failed_units,
            } => format!("Phase {} blocked by {}", phase, failed_units.join(", ")),
            _ => return,
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Resumed {
                interrupted,
                escalations_requeued,
            } => {
                if !interrupted.is_empty() || *escalations_requeued > 0 {
                    self.println(format!(
                        "{} Resumed: {} interrupted unit(s) requeued, {} escalation(s) pending",
                        PIVOT,
                        style(interrupted.len()).yellow(),
                        escalations_requeued
                    ));
                }
            }
            EngineEvent::PhaseStarted { phase } => {
                self.println(String::new());
                self.println(format!(
                    "{} Phase {}",
                    GATE,
                    style(phase).bold().underlined()
                ));
            }
            EngineEvent::WaveStarted { phase, wave, units } => {
                self.println(format!(
                    "{} {} Wave {} of {}: {}",
                    WAVE,
                    style("═".repeat(40)).cyan(),
                    style(wave).yellow().bold(),
                    phase,
                    style(units.join(", ")).dim()
                ));
                self.header_bar
                    .set_message(format!("{} wave {} ({} units)", phase, wave, units.len()));
            }
            EngineEvent::UnitDispatched {
                unit,
                attempt,
                ..
            } => self.on_unit_dispatched(unit, *attempt),
            EngineEvent::UnitStarted { unit } => {
                self.set_unit_message(unit, format!("{} running", RUNNING));
            }
            EngineEvent::UnitCompleted { unit, status } => {
                let msg = match status {
                    WorkerStatus::Success => format!("{} verifying", REVIEW),
                    WorkerStatus::CorrectionsNeeded => "worker asked for corrections".to_string(),
                    WorkerStatus::Failure => "worker reported failure".to_string(),
                };
                self.set_unit_message(unit, msg);
            }
            EngineEvent::UnitVerified { unit, artifacts } => {
                self.finish_unit(unit, format!("{} verified", CHECK));
                self.header_bar.inc(1);
                if self.verbose && !artifacts.is_empty() {
                    self.println(format!(
                        "    {} {}: {}",
                        SPARKLE,
                        unit,
                        style(artifacts.join(", ")).dim()
                    ));
                }
            }
            EngineEvent::CorrectionsRequested {
                unit,
                attempt,
                findings,
            } => {
                self.finish_unit(unit, format!("{} corrections after attempt {}", PIVOT, attempt));
                if self.verbose {
                    for finding in findings {
                        self.println(format!("    - {}", style(finding).yellow()));
                    }
                }
            }
            EngineEvent::GuidanceRefetch {
                unit,
                domain,
                dispatched,
                current,
            } => {
                self.finish_unit(
                    unit,
                    format!(
                        "{} stale guidance for {} (v{} < v{})",
                        PIVOT, domain, dispatched, current
                    ),
                );
            }
            EngineEvent::UnitInterrupted { unit, error } => {
                self.finish_unit(unit, format!("{} interrupted ({}), requeued", CLOCK, error));
            }
            EngineEvent::UnitFailed {
                unit,
                error,
                findings,
            } => {
                self.finish_unit(unit, format!("{} failed: {}", CROSS, error));
                self.println(format!(
                    "  {} Unit {} {}: {}",
                    CROSS,
                    style(unit).red().bold(),
                    style("failed").red(),
                    error
                ));
                for finding in findings {
                    self.println(format!("    - {}", finding));
                }
            }
            EngineEvent::GuidanceUpdated {
                domain,
                version,
                affected,
            } => {
                let suffix = if affected.is_empty() {
                    String::new()
                } else {
                    format!(" (stale: {})", affected.join(", "))
                };
                self.println(format!(
                    "  {} Guidance {} is now v{}{}",
                    RULING,
                    style(domain).cyan(),
                    version,
                    suffix
                ));
            }
            EngineEvent::WaveCompleted {
                wave,
                verified,
                failed,
                ..
            } => {
                let emoji = if *failed == 0 { CHECK } else { CROSS };
                self.println(format!(
                    "{} Wave {}: {} verified, {}",
                    emoji,
                    wave,
                    style(verified).green(),
                    if *failed > 0 {
                        style(format!("{} failed", failed)).red().to_string()
                    } else {
                        style("0 failed").dim().to_string()
                    }
                ));
            }
            EngineEvent::PhaseAwaitingApproval { phase } => {
                self.println(format!(
                    "{} Phase {} is awaiting approval",
                    GATE,
                    style(phase).yellow().bold()
                ));
            }
            EngineEvent::PhaseApproved { phase } => {
                self.println(format!(
                    "{} Phase {} {}",
                    CHECK,
                    style(phase).green().bold(),
                    style("approved").green()
                ));
            }
            EngineEvent::PhaseRejected { phase, comments } => {
                self.println(format!(
                    "{} Phase {} {}: {}",
                    CROSS,
                    style(phase).red().bold(),
                    style("rejected").red(),
                    comments
                ));
            }
            EngineEvent::PhaseBlocked {
                phase,
                failed_units,
            } => {
                self.println(format!(
                    "{} Phase {} blocked by {}",
                    BLOCKER,
                    style(phase).red().bold(),
                    failed_units.join(", ")
                ));
            }
        }
    }

    fn on_unit_dispatched(&self, unit: &str, attempt: u32) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(bar_style("  {spinner} {prefix:.bold} {msg} {elapsed:.dim}"));
        bar.set_prefix(format!("[{}]", unit));
        bar.set_message(if attempt > 1 {
            format!("waiting for leases (attempt {})", attempt)
        } else {
            "waiting for leases".to_string()
        });
        bar.enable_steady_tick(Duration::from_millis(100));

        let mut bars = self.unit_bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = bars.insert(unit.to_string(), bar) {
            old.finish_and_clear();
        }
    }

    fn set_unit_message(&self, unit: &str, msg: String) {
        let bars = self.unit_bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.get(unit) {
            bar.set_message(msg);
        }
    }

    fn finish_unit(&self, unit: &str, msg: String) {
        let mut bars = self.unit_bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.remove(unit) {
            bar.set_style(bar_style("  {prefix:.bold} {msg}"));
            bar.finish_with_message(msg);
        }
    }

    fn println(&self, line: String) {
        self.multi.println(line).ok();
    }

    /// Print the end-of-run summary.
    pub fn finish(&self, outcome: &RunOutcome) {
        self.header_bar.finish_and_clear();
        if self.mode == UiMode::Json {
            if let Ok(json) = serde_json::to_string(outcome) {
                let _ = writeln!(&self.term, "{}", json);
            }
            return;
        }

        let line = match outcome {
            RunOutcome::Completed => format!("{} All phases approved", SPARKLE),
            RunOutcome::AwaitingApproval { phase } => format!(
                "{} Phase {} is awaiting approval. Run `stagehand gate approve {}` or `stagehand gate reject {}`.",
                GATE, phase, phase, phase
            ),
            RunOutcome::ChecklistPending { phase, items } => format!(
                "{} Phase {} has open checklist items: {}. Close them with `stagehand gate check {} <item>`.",
                GATE,
                phase,
                items.join(", "),
                phase
            ),
            RunOutcome::Halted { phase, failed } => format!(
                "{} Phase {} halted; failed units: {}. Fix and run `stagehand requeue <unit>`.",
                BLOCKER,
                phase,
                failed.join(", ")
            ),
            RunOutcome::Rejected { phase, comments } => format!(
                "{} Phase {} was rejected: {}",
                CROSS, phase, comments
            ),
        };
        let _ = writeln!(&self.term);
        let _ = writeln!(&self.term, "{}", line);
    }
}
