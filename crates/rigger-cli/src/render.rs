use std::cell::RefCell;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use rigger_engine::{
    ApplyReport, DiffKind, DotfileDiff, DotfileState, ItemOutcome, ItemStatus, PluginOutcome,
    ProgressSink, RepositoryState, StatusReport,
};
use rigger_snapshot::{DigestMismatch, RestoreItem, RestoreOutcome};
use rigger_state::{UndoOutcome, UndoReport};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

pub fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" | "applied" => "[OK]",
        "warn" => "[WARN]",
        "err" | "failed" => "[ERR]",
        _ => "[..]",
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{}", colorize(section_style(), &line));
        }
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

struct StageProgress {
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

/// Prints one line per finished item, with a progress bar per stage in rich mode.
pub struct TerminalProgress {
    style: OutputStyle,
    active: RefCell<Option<StageProgress>>,
}

impl TerminalProgress {
    pub fn new(style: OutputStyle) -> Self {
        Self {
            style,
            active: RefCell::new(None),
        }
    }

    fn start_bar(&self, label: &str, total: u64) -> Option<ProgressBar> {
        if self.style != OutputStyle::Rich {
            return None;
        }
        let progress_bar = ProgressBar::new(total.max(1));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<14} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
        ) {
            progress_bar.set_style(
                style
                    .tick_chars(progress_tick_chars(label))
                    .progress_chars("=>-"),
            );
        }
        progress_bar.set_message(label.to_string());
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        Some(progress_bar)
    }
}

impl ProgressSink for TerminalProgress {
    fn stage_started(&self, stage: &str, total: usize) {
        if total == 0 {
            return;
        }
        TerminalRenderer::from_style(self.style).print_section(stage);
        let total = total as u64;
        *self.active.borrow_mut() = Some(StageProgress {
            label: stage.to_string(),
            total,
            current: 0,
            progress_bar: self.start_bar(stage, total),
            started_at: Instant::now(),
        });
    }

    fn item_finished(&self, stage: &str, outcome: &ItemOutcome) {
        let line = format_outcome_line(self.style, stage, outcome);
        let mut active = self.active.borrow_mut();
        match active.as_mut() {
            Some(progress) => {
                progress.current = (progress.current + 1).min(progress.total);
                match &progress.progress_bar {
                    Some(progress_bar) => {
                        progress_bar.println(line);
                        progress_bar.set_position(progress.current);
                    }
                    None => println!("{line}"),
                }
            }
            None => println!("{line}"),
        }
    }

    fn stage_finished(&self, _stage: &str) {
        let Some(mut progress) = self.active.borrow_mut().take() else {
            return;
        };
        let Some(progress_bar) = progress.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &progress.label,
            progress.current,
            progress.total,
            Some(progress.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }
}

pub fn format_outcome_line(style: OutputStyle, stage: &str, outcome: &ItemOutcome) -> String {
    let message = if outcome.detail.is_empty() {
        format!("{stage}: {} {}", outcome.item, outcome.status)
    } else {
        format!(
            "{stage}: {} {} ({})",
            outcome.item, outcome.status, outcome.detail
        )
    };
    render_status_line(style, outcome.status.as_str(), &message)
}

pub fn format_apply_summary_lines(report: &ApplyReport, style: OutputStyle) -> Vec<String> {
    let applied = report.count(ItemStatus::Applied);
    let skipped = report.count(ItemStatus::Skipped);
    let failed = report.failures();
    let verb = if report.dry_run { "would apply" } else { "applied" };
    let summary = format!("{verb} {applied}, skipped {skipped}, failed {failed}");
    let mut lines = vec![render_status_line(
        style,
        if failed == 0 { "ok" } else { "err" },
        &summary,
    )];
    if let Some(point) = &report.rollback_point {
        lines.push(render_status_line(
            style,
            "step",
            &format!("rollback point: {}", point.display()),
        ));
    }
    if report.dry_run {
        lines.push(render_status_line(
            style,
            "step",
            "dry run: nothing was changed",
        ));
    }
    lines
}

pub fn format_undo_lines(report: &UndoReport, style: OutputStyle) -> Vec<String> {
    if report.is_empty() {
        return vec![render_status_line(style, "step", "nothing to undo")];
    }
    let mut lines: Vec<String> = report
        .entries
        .iter()
        .map(|entry| {
            let status = match &entry.outcome {
                UndoOutcome::Undone => "ok",
                UndoOutcome::SkippedAlreadyAbsent => "step",
                UndoOutcome::ManualActionRequired(_) => "warn",
                UndoOutcome::Error(_) => "err",
            };
            let message = match &entry.outcome {
                UndoOutcome::ManualActionRequired(hint) => {
                    format!("{} {}: manual action required ({hint})", entry.action, entry.path)
                }
                UndoOutcome::Error(reason) => {
                    format!("{} {}: undo failed ({reason})", entry.action, entry.path)
                }
                outcome => format!("{} {}: {}", entry.action, entry.path, outcome),
            };
            render_status_line(style, status, &message)
        })
        .collect();
    lines.push(render_status_line(
        style,
        if report.has_errors() { "err" } else { "ok" },
        &format!("undone {} of {} changes", report.undone(), report.entries.len()),
    ));
    lines
}

pub fn format_status_lines(report: &StatusReport, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "step",
        &format!("specification: {} (profile {})", report.spec_name, report.profile),
    )];
    for dotfile in &report.dotfiles {
        let (status, state) = match &dotfile.state {
            DotfileState::Linked => ("ok", "linked".to_string()),
            DotfileState::Rendered => ("ok", "rendered".to_string()),
            DotfileState::Mismatch(detail) => ("warn", format!("mismatch ({detail})")),
            DotfileState::Missing => ("warn", "missing".to_string()),
            DotfileState::Refused(reason) => ("err", format!("refused ({reason})")),
        };
        lines.push(render_status_line(
            style,
            status,
            &format!("dotfile {}: {state}", dotfile.target),
        ));
    }
    for repo in &report.repositories {
        let (status, state) = match repo.state {
            RepositoryState::Present => ("ok", "present"),
            RepositoryState::NotCheckout => ("warn", "not a git checkout"),
            RepositoryState::Missing => ("warn", "missing"),
            RepositoryState::Refused => ("err", "refused"),
        };
        lines.push(render_status_line(
            style,
            status,
            &format!("repository {}: {state}", repo.path),
        ));
    }
    if let Some(interrupted) = &report.interrupted {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "interrupted {} started {}",
                interrupted.operation, interrupted.timestamp
            ),
        ));
    }
    if let Some(point) = &report.latest_rollback_point {
        lines.push(render_status_line(
            style,
            "step",
            &format!("latest rollback point: {}", point.display()),
        ));
    }
    if let Some(snapshot) = &report.latest_snapshot {
        lines.push(render_status_line(
            style,
            "step",
            &format!("latest snapshot: {}", snapshot.display()),
        ));
    }
    lines
}

pub fn format_diff_lines(diffs: &[DotfileDiff], style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for diff in diffs {
        let (status, label) = match diff.kind {
            DiffKind::New => ("warn", "new file"),
            DiffKind::Changed => ("warn", "changed"),
            DiffKind::Unchanged => ("ok", "unchanged"),
            DiffKind::Skipped => ("err", "skipped"),
        };
        let message = match &diff.note {
            Some(note) => format!("{}: {label} ({note})", diff.target),
            None => format!("{}: {label}", diff.target),
        };
        lines.push(render_status_line(style, status, &message));
        if let Some(patch) = &diff.patch {
            lines.extend(patch.lines().map(|line| colorize_patch_line(style, line)));
        }
    }
    lines
}

fn colorize_patch_line(style: OutputStyle, line: &str) -> String {
    if style == OutputStyle::Plain {
        return line.to_string();
    }
    let color = if line.starts_with("+++") || line.starts_with("---") {
        None
    } else if line.starts_with('+') {
        Some(AnsiColor::Green)
    } else if line.starts_with('-') {
        Some(AnsiColor::Red)
    } else if line.starts_with("@@") {
        Some(AnsiColor::Cyan)
    } else {
        None
    };
    match color {
        Some(color) => colorize(Style::new().fg_color(Some(color.into())), line),
        None => line.to_string(),
    }
}

pub fn format_plugin_lines(outcomes: &[PluginOutcome], style: OutputStyle) -> Vec<String> {
    outcomes
        .iter()
        .map(|outcome| match (&outcome.error, outcome.success) {
            (Some(error), _) => {
                render_status_line(style, "err", &format!("{}: {error}", outcome.name))
            }
            (None, true) => render_status_line(style, "ok", &format!("{}: done", outcome.name)),
            (None, false) => {
                render_status_line(style, "err", &format!("{}: reported failure", outcome.name))
            }
        })
        .collect()
}

pub fn format_restore_lines(items: &[RestoreItem], style: OutputStyle) -> Vec<String> {
    items
        .iter()
        .map(|item| match &item.outcome {
            RestoreOutcome::Restored => {
                render_status_line(style, "ok", &format!("restored {}", item.target))
            }
            RestoreOutcome::NotFoundInArchive => render_status_line(
                style,
                "warn",
                &format!("{}: not in snapshot", item.target),
            ),
            RestoreOutcome::Rejected(reason) => render_status_line(
                style,
                "err",
                &format!("{}: rejected ({reason})", item.target),
            ),
            RestoreOutcome::Failed(reason) => render_status_line(
                style,
                "err",
                &format!("{}: failed ({reason})", item.target),
            ),
        })
        .collect()
}

pub fn format_mismatch_lines(mismatches: &[DigestMismatch], style: OutputStyle) -> Vec<String> {
    mismatches
        .iter()
        .map(|mismatch| {
            let actual = mismatch.actual.as_deref().unwrap_or("absent");
            render_status_line(
                style,
                "warn",
                &format!(
                    "{}: digest {} does not match snapshot {}",
                    mismatch.target,
                    short_digest(actual),
                    short_digest(&mismatch.expected)
                ),
            )
        })
        .collect()
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "packages" => ".oO@* ",
        "repositories" => "<^>v ",
        "dotfiles" => "-=~* ",
        "scripts" => ".:;* ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
