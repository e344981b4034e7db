//! Keyboard and signal control plane.
//!
//! Translates keystrokes and Unix signals into pool mutations. The
//! keyboard listener only runs when stdin is a terminal (raw mode is
//! owned by the renderer's screen guard); signals are handled either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::Pool;

/// Ctrl-C semantics: stop spawning, drain the queue to `aborted`, and
/// kill every running slot.
fn interrupt(pool: &Pool) {
    pool.abort();
    pool.kill_all_running();
}

/// SIGINT and SIGTERM interrupt the run; SIGWINCH forces a re-layout.
pub fn spawn_signal_handler(
    pool: Arc<Pool>,
    relayout: Arc<AtomicBool>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigwinch =
            signal(SignalKind::window_change()).expect("failed to install SIGWINCH handler");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sigint.recv() => interrupt(&pool),
                _ = sigterm.recv() => interrupt(&pool),
                _ = sigwinch.recv() => relayout.store(true, Ordering::Relaxed),
            }
        }
    })
}

/// Raw-mode key listener. `k` opens a select-slot sub-mode: digits then
/// Enter choose the slot to kill, Esc backs out.
pub fn spawn_keyboard(
    pool: Arc<Pool>,
    relayout: Arc<AtomicBool>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = EventStream::new();
        let mut kill_slot: Option<String> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = events.next() => match maybe {
                    Some(Ok(Event::Key(key))) if key.kind != KeyEventKind::Release => {
                        handle_key(&pool, key, &mut kill_slot);
                    }
                    Some(Ok(Event::Resize(_, _))) => relayout.store(true, Ordering::Relaxed),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
        }
    })
}

fn handle_key(pool: &Pool, key: KeyEvent, kill_slot: &mut Option<String>) {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        interrupt(pool);
        return;
    }
    if let Some(buf) = kill_slot.as_mut() {
        match key.code {
            KeyCode::Char(c) if c.is_ascii_digit() => buf.push(c),
            KeyCode::Enter => {
                if let Ok(slot) = buf.parse::<usize>() {
                    pool.kill(slot);
                }
                *kill_slot = None;
            }
            KeyCode::Esc => *kill_slot = None,
            _ => {}
        }
        return;
    }
    match key.code {
        KeyCode::Char('p') => pool.pause(),
        KeyCode::Char('r') => pool.resume(),
        KeyCode::Char('a') => pool.abort(),
        KeyCode::Char('k') => *kill_slot = Some(String::new()),
        _ => {}
    }
}
