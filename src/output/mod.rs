//! Terminal rendering for build statistics.
//!
//! The statistics table is repainted in place: callers keep the line count
//! returned by [`draw`] and pass it back on the next call so exactly that
//! many lines are erased before the new table is written.

use std::fmt::Write as _;
use std::io::Write;
use std::time::Duration;

use console::{style, Term};

use crate::circle::types::{Action, BuildDetail};
use crate::error::Result;

const STEP_WIDTH: usize = 45;
const CELL_WIDTH: usize = 8;

/// Scale a duration to the largest unit that keeps the numeral compact.
/// Values in the same unit bracket render with the same length, so the
/// decimal points line up when cells are right-aligned.
pub fn time_scaler(d: Duration) -> String {
    if d == Duration::ZERO {
        return "0.0ms".to_string();
    }
    if d >= Duration::from_secs(60) {
        let mins = d.as_secs() / 60;
        let secs = d.as_secs() % 60;
        format!("{mins}m{secs:02}s")
    } else if d >= Duration::from_secs(1) {
        format!("{:.1}s", d.as_secs_f64())
    } else if d >= Duration::from_micros(50) {
        format!("{:.0}ms", d.as_secs_f64() * 1e3)
    } else if d >= Duration::from_micros(1) {
        format!("{:.0}µs", d.as_secs_f64() * 1e6)
    } else {
        format!("{}ns", d.subsec_nanos())
    }
}

/// Whole-second rendering in the familiar 1h2m3s shape.
pub fn format_elapsed(d: Duration) -> String {
    let secs = (d.as_millis() as f64 / 1000.0).round() as u64;
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Display rounding: runtimes over a minute to the nearest second, the rest
/// to the nearest 10ms.
fn round_runtime(millis: u64) -> Duration {
    if millis > 60_000 {
        Duration::from_secs((millis + 500) / 1000)
    } else {
        Duration::from_millis((millis + 5) / 10 * 10)
    }
}

fn action_cell(action: &Action, color: bool) -> String {
    let text = match action.run_time_millis {
        // unknown runtime renders as an empty cell
        None => String::new(),
        Some(ms) => time_scaler(round_runtime(ms)),
    };
    let padded = format!("{text:>width$}", width = CELL_WIDTH);
    if color && action.is_failed() {
        style(padded).color256(160).force_styling(true).to_string()
    } else {
        padded
    }
}

/// Render the per-step timing table for a build: one header row listing
/// container indices, one row per step, and a trailing elapsed line while
/// the build is running. With `color` set, failed actions are wrapped in a
/// red escape sequence.
pub fn statistics(build: &BuildDetail, color: bool) -> Result<String> {
    let parallel = build.parallel.max(1) as usize;
    let mut out = String::new();
    let _ = write!(out, "{:<width$}", "Step", width = STEP_WIDTH);
    for i in 0..parallel {
        let _ = write!(out, "{i:<width$}", width = CELL_WIDTH);
    }
    let _ = write!(
        out,
        "\n{}\n",
        "=".repeat(STEP_WIDTH + CELL_WIDTH * parallel)
    );
    for step in &build.steps {
        let name = step.name.replace('\n', "\\n");
        if name.chars().count() > STEP_WIDTH - 2 {
            let truncated: String = name.chars().take(STEP_WIDTH - 2).collect();
            let _ = write!(out, "{truncated}… ");
        } else {
            let _ = write!(out, "{name:<width$}", width = STEP_WIDTH);
        }
        // every row gets exactly `parallel` cells; actions land at their own
        // container index and gaps stay blank
        let mut cells: Vec<Option<&Action>> = vec![None; parallel];
        for action in &step.actions {
            let idx = action.index as usize;
            if idx < parallel {
                cells[idx] = Some(action);
            }
        }
        for cell in cells {
            match cell {
                None => out.push_str(&" ".repeat(CELL_WIDTH)),
                Some(action) => out.push_str(&action_cell(action, color)),
            }
        }
        out.push('\n');
    }
    if build.status().running() {
        let elapsed = build.elapsed()?;
        let _ = writeln!(
            out,
            "Build {} running ({} elapsed)",
            build.build_num,
            format_elapsed(elapsed)
        );
    }
    Ok(out)
}

/// Erase `lines` previously drawn lines so the next write repaints in place.
pub fn clear_lines(w: &mut impl Write, lines: usize) {
    let _ = write!(w, "{}", "\x1b[2K\r\x1b[1A".repeat(lines));
}

/// Repaint the statistics table over the previous draw. Returns the line
/// count the caller must erase before the next draw.
pub fn draw(w: &mut impl Write, stats: &str, prev_lines: usize) -> usize {
    clear_lines(w, prev_lines);
    let _ = write!(w, "{stats}\n");
    let _ = w.flush();
    stats.matches('\n').count() + 1
}

/// Hides the cursor for an interactive session. Restoring on drop covers
/// every exit path, including errors.
pub struct CursorGuard {
    term: Term,
    active: bool,
}

impl CursorGuard {
    pub fn hide() -> Self {
        let term = Term::stdout();
        let active = term.is_term();
        if active {
            let _ = term.hide_cursor();
        }
        Self { term, active }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = self.term.show_cursor();
        }
    }
}
