//! Terminal dashboard.
//!
//! A renderer task redraws the whole frame at a fixed cadence from a pool
//! snapshot: powerline-style header segments, a progress bar, one row per
//! worker slot, and the key help footer. The pool lock is never held
//! across a terminal write.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use crossterm::{execute, queue};
use tokio_util::sync::CancellationToken;

use crate::config::{Settings, Symbols};
use crate::job::JobState;
use crate::pool::{Pool, PoolSnapshot, SlotSnapshot};

const FRAME: Duration = Duration::from_millis(100);

/// Raw mode plus the alternate screen, restored on drop so every exit
/// path (including panics unwinding through the driver) puts the
/// terminal back.
pub struct Screen;

impl Screen {
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        execute!(io::stderr(), EnterAlternateScreen, Hide)?;
        Ok(Self)
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let _ = execute!(io::stderr(), LeaveAlternateScreen, Show);
        let _ = disable_raw_mode();
    }
}

/// `H:MM:SS`, the way durations read everywhere in the UI and summary.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, total % 3600 / 60, total % 60)
}

pub async fn run_renderer(
    pool: Arc<Pool>,
    settings: Arc<Settings>,
    run_path: String,
    token: CancellationToken,
    relayout: Arc<AtomicBool>,
    started: Instant,
) {
    let mut ticker = tokio::time::interval(FRAME);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = pool.snapshot();
        let full_clear = relayout.swap(false, Ordering::Relaxed);
        let _ = draw_frame(&snapshot, &settings, &run_path, started, full_clear);
    }
    // One last frame so the final states are on screen when the run ends.
    let snapshot = pool.snapshot();
    let _ = draw_frame(&snapshot, &settings, &run_path, started, false);
}

fn draw_frame(
    snap: &PoolSnapshot,
    settings: &Settings,
    run_path: &str,
    started: Instant,
    full_clear: bool,
) -> io::Result<()> {
    let (width, height) = terminal::size()?;
    let width = width as usize;
    let mut out = io::stderr().lock();
    if full_clear {
        queue!(out, Clear(ClearType::All))?;
    }

    // Header segments.
    let elapsed = format_hms(started.elapsed());
    let segments = [
        (format!("Running: {}", snap.running), Color::DarkBlue),
        (format!("Done: {}/{}", snap.done(), snap.total), Color::DarkGreen),
        (format!("Failed: {}", snap.non_success()), Color::DarkRed),
        (format!("Duration: {elapsed}"), Color::DarkGrey),
        (format!("ETA: {}", estimate_eta(snap)), Color::DarkMagenta),
    ];
    queue!(out, MoveTo(0, 0))?;
    draw_segments(&mut out, &settings.symbols, &segments)?;
    queue!(out, Clear(ClearType::UntilNewLine))?;

    // Run context line.
    queue!(out, MoveTo(0, 1))?;
    let context = truncated(
        &format!(" Dirlog: {run_path} Command: {}", settings.command_label),
        width,
    );
    queue!(out, Print(context), Clear(ClearType::UntilNewLine))?;

    // Progress bar.
    queue!(out, MoveTo(0, 2))?;
    draw_progress(&mut out, snap, &settings.symbols, width)?;

    // One row per worker slot.
    let mut row = 3u16;
    for slot in &snap.slots {
        if usize::from(row) + 1 >= height as usize {
            break;
        }
        queue!(out, MoveTo(0, row))?;
        draw_slot(&mut out, slot, settings, width)?;
        row += 1;
    }

    // Key help footer.
    let help = if snap.paused {
        "[r]esume [a]bort [k]ill <slot>"
    } else {
        "[p]ause [a]bort [k]ill <slot>"
    };
    queue!(out, MoveTo(0, row), Clear(ClearType::FromCursorDown))?;
    queue!(out, MoveTo(0, height.saturating_sub(1)), Print(help), Clear(ClearType::UntilNewLine))?;
    out.flush()
}

fn draw_segments<W: Write>(out: &mut W, symbols: &Symbols, segments: &[(String, Color)]) -> io::Result<()> {
    let Some((_, first)) = segments.first() else {
        return Ok(());
    };
    queue!(out, SetForegroundColor(*first), Print(&symbols.begin))?;
    for (i, (text, color)) in segments.iter().enumerate() {
        queue!(
            out,
            SetBackgroundColor(*color),
            SetForegroundColor(Color::White),
            Print(format!(" {text} "))
        )?;
        queue!(out, ResetColor)?;
        if let Some((_, next)) = segments.get(i + 1) {
            queue!(out, SetBackgroundColor(*next))?;
        }
        queue!(out, SetForegroundColor(*color), Print(&symbols.end))?;
    }
    queue!(out, ResetColor)?;
    Ok(())
}

fn draw_progress<W: Write>(
    out: &mut W,
    snap: &PoolSnapshot,
    symbols: &Symbols,
    width: usize,
) -> io::Result<()> {
    let bar_width = width.saturating_sub(10).max(10);
    let filled = if snap.total == 0 {
        0
    } else {
        bar_width * snap.done() / snap.total
    };
    let bar = format!(
        " {}{} {}/{}",
        symbols.prog.repeat(filled),
        " ".repeat(bar_width - filled),
        snap.done(),
        snap.total
    );
    queue!(
        out,
        SetForegroundColor(Color::DarkBlue),
        Print(truncated(&bar, width)),
        ResetColor,
        Clear(ClearType::UntilNewLine)
    )?;
    Ok(())
}

fn draw_slot<W: Write>(
    out: &mut W,
    slot: &SlotSnapshot,
    settings: &Settings,
    width: usize,
) -> io::Result<()> {
    queue!(out, Print(format!(" {:02} ", slot.slot_id)))?;
    match &slot.job {
        Some(job) => {
            let color = state_color(job.state);
            queue!(out, SetForegroundColor(color), Print(&settings.symbols.begin))?;
            queue!(
                out,
                SetBackgroundColor(color),
                SetForegroundColor(Color::White),
                Print(format!(" {:8} ", job.state.label())),
                ResetColor
            )?;
            queue!(out, SetForegroundColor(color), Print(&settings.symbols.end), ResetColor)?;
            let host = crate::host::display_host(&job.host, settings.max_dots);
            let head = format!(" {} {} ", format_hms(job.elapsed), host);
            let tail_room = width.saturating_sub(16 + head.chars().count());
            queue!(
                out,
                Print(&head),
                SetForegroundColor(Color::DarkGrey),
                Print(truncated(&job.last_line, tail_room)),
                ResetColor
            )?;
        }
        None => {
            queue!(
                out,
                SetForegroundColor(Color::DarkGrey),
                Print(format!("{} idle", settings.symbols.rest)),
                ResetColor
            )?;
        }
    }
    queue!(out, Clear(ClearType::UntilNewLine))?;
    Ok(())
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Running => Color::DarkBlue,
        JobState::Success => Color::DarkGreen,
        JobState::Failed | JobState::Timeout | JobState::Killed | JobState::Aborted => {
            Color::DarkRed
        }
        JobState::Queued => Color::DarkGrey,
    }
}

/// Mean-duration estimate of the time left, `.:..:..` before any job
/// finished.
fn estimate_eta(snap: &PoolSnapshot) -> String {
    let finished = snap.success + snap.failed + snap.timeout + snap.killed;
    if finished == 0 || snap.total == snap.done() {
        return if snap.total == snap.done() {
            format_hms(Duration::ZERO)
        } else {
            ".:..:..".to_string()
        };
    }
    let avg = snap.done_duration / finished as u32;
    let remaining = (snap.total - snap.done()) as u32;
    let active = snap.running.max(1) as u32;
    format_hms(avg * remaining.div_ceil(active))
}

fn truncated(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}
