//! Event types and the input/tick driver for the fleetwatch TUI.
//!
//! The [`EventHandler`] owns a background task that polls crossterm for key
//! presses and emits periodic [`Event::Tick`]s. Other tasks, such as the fleet
//! poller in `main.rs`, post their results through [`EventHandler::tx`].

use crate::fleet::DisposalBatch;
use crossterm::event::{self, Event as CrosstermEvent, KeyEvent, KeyEventKind};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::error;

/// Events processed by the application event loop.
#[derive(Debug)]
pub enum Event {
    /// Periodic tick used for redraws.
    Tick,
    /// User key press from the terminal.
    Input(KeyEvent),
    /// A fleet update cycle finished.
    FleetUpdate {
        /// Map artifacts of evicted flights. `None` when the cycle was aborted
        /// or skipped because another one was running.
        disposal: Option<DisposalBatch>,
        /// When the cycle finished.
        timestamp: Instant,
        /// Whether the cycle ran to completion.
        is_success: bool,
    },
}

/// Multiplexes terminal input and ticks into a single event stream.
///
/// The sender can be cloned and handed to other tasks; the receiver is
/// drained by [`next`](EventHandler::next) in the main loop.
pub struct EventHandler {
    pub tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
    /// Creates the handler and spawns the input/tick task.
    ///
    /// The task polls crossterm with a timeout of `tick_rate_ms`. It stops
    /// when the receiver is dropped or the terminal can no longer be read.
    pub fn new(tick_rate_ms: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let event_tx = tx.clone();

        tokio::task::spawn_blocking(move || {
            let tick_rate = Duration::from_millis(tick_rate_ms);
            let mut last_tick = Instant::now();
            loop {
                let timeout = tick_rate
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::from_secs(0));
                match event::poll(timeout) {
                    Ok(true) => match event::read() {
                        Ok(CrosstermEvent::Key(key)) if key.kind == KeyEventKind::Press => {
                            if event_tx.send(Event::Input(key)).is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Terminal read failed: {}", e);
                            return;
                        }
                    },
                    Ok(false) => {}
                    Err(e) => {
                        error!("Terminal poll failed: {}", e);
                        return;
                    }
                }
                if last_tick.elapsed() >= tick_rate {
                    if event_tx.send(Event::Tick).is_err() {
                        return;
                    }
                    last_tick = Instant::now();
                }
            }
        });

        Self { tx, rx }
    }

    /// Receives the next event. `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
