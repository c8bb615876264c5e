use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use rigger_engine::CancelToken;
use tracing::{debug, warn};

use crate::render::{current_output_style, render_status_line};

const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Finish the current stage, then abort and undo the run.
    Cancel,
    /// A second interrupt: leave immediately.
    Exit,
}

/// Counts interrupts against one cancellation token.
#[derive(Debug, Clone)]
pub struct InterruptState {
    token: CancelToken,
    received: Arc<AtomicU32>,
}

impl InterruptState {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            received: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn on_interrupt(&self) -> InterruptAction {
        if self.received.fetch_add(1, Ordering::SeqCst) == 0 {
            self.token.cancel();
            InterruptAction::Cancel
        } else {
            InterruptAction::Exit
        }
    }
}

/// Listens for Ctrl+C on a background thread. The first interrupt cancels
/// `token`; a second one exits the process.
pub fn install_interrupt_handler(token: &CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    let state = InterruptState::new(token.clone());

    thread::Builder::new()
        .name("rigger-interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "failed to listen for interrupts");
                        return;
                    }
                    match state.on_interrupt() {
                        InterruptAction::Cancel => eprintln!(
                            "{}",
                            render_status_line(
                                current_output_style(),
                                "warn",
                                "interrupted, stopping after the current stage; \
                                 press Ctrl+C again to exit now",
                            )
                        ),
                        InterruptAction::Exit => std::process::exit(INTERRUPTED_EXIT_CODE),
                    }
                }
            });
        })
        .context("failed to spawn interrupt listener")?;
    debug!("interrupt handler installed");
    Ok(())
}
