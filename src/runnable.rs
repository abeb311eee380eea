//! Cooperative run-state probing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::SigId;
use signal_hook::consts::SIGINT;
use tracing::debug;

/// Anything with a pollable "should I keep going" state.
///
/// `is_running` may do work (drain events) before answering; callers are
/// expected to invoke it once per loop iteration or I/O wait.
pub trait Runnable {
    fn is_running(&mut self) -> bool;

    fn stop(&mut self);
}

/// Minimal [`Runnable`] for simple tools: runs until SIGINT arrives.
///
/// No shared memory, no control channel; just a flag flipped by the signal
/// handler and polled by the owner.
pub struct RunningUntilSignalled {
    terminated: Arc<AtomicBool>,
    sig_id: Option<SigId>,
}

impl RunningUntilSignalled {
    pub fn new() -> std::io::Result<Self> {
        let terminated = Arc::new(AtomicBool::new(false));
        let sig_id = signal_hook::flag::register(SIGINT, Arc::clone(&terminated))?;
        Ok(Self {
            terminated,
            sig_id: Some(sig_id),
        })
    }
}

impl Runnable for RunningUntilSignalled {
    fn is_running(&mut self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        debug!("RunningUntilSignalled stopped by owner");
        self.terminated.store(true, Ordering::SeqCst);
    }
}

impl Drop for RunningUntilSignalled {
    fn drop(&mut self) {
        if let Some(id) = self.sig_id.take() {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flips_running_state() {
        let mut running = RunningUntilSignalled::new().expect("register SIGINT flag");
        assert!(running.is_running());
        running.stop();
        assert!(!running.is_running());
    }
}
