//! Cooperative stop signal for the tracking loop.
//!
//! `StopHandle::stop` may be called from any task (e.g. the Ctrl+C watcher);
//! the loop observes it through `StopSignal` between iterations and while
//! sleeping.

use log::{info, warn};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested. Never resolves if every
    /// handle was dropped without stopping.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Installs the Ctrl+C handler immediately. The first interrupt requests a
/// stop; a second one exits the process without waiting for the measurement.
///
/// Must be called from within a tokio runtime.
pub fn watch_interrupts(handle: StopHandle) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut interrupts =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    #[cfg(windows)]
    let mut interrupts = tokio::signal::windows::ctrl_c()?;

    tokio::spawn(async move {
        if interrupts.recv().await.is_none() {
            return;
        }
        info!("Stop requested, finishing current measurement (Ctrl+C again to quit now)");
        handle.stop();

        if interrupts.recv().await.is_some() {
            warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });

    Ok(())
}
