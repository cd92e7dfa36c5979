//! Flush Timer
//!
//! One background thread per engine. The write path arms it after buffering
//! an op; the flush path disarms it when a flush begins. When the deadline
//! passes the thread runs a flush on the engine core.
//!
//! The thread only holds a `Weak` reference, so it never keeps a dropped
//! engine alive.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::inner::Core;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerMsg {
    /// Start the countdown unless one is already running
    Arm,
    Disarm,
    Shutdown,
}

/// Sending side, owned by the engine core
#[derive(Debug, Clone)]
pub(crate) struct TimerHandle {
    tx: Sender<TimerMsg>,
}

impl TimerHandle {
    pub fn arm(&self) {
        // A send error means the thread already exited; nothing to arm.
        let _ = self.tx.send(TimerMsg::Arm);
    }

    pub fn disarm(&self) {
        let _ = self.tx.send(TimerMsg::Disarm);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerMsg::Shutdown);
    }
}

pub(crate) fn channel() -> (TimerHandle, Receiver<TimerMsg>) {
    let (tx, rx) = channel::unbounded();
    (TimerHandle { tx }, rx)
}

/// Start the timer thread
pub(crate) fn spawn(
    rx: Receiver<TimerMsg>,
    core: Weak<Core>,
    delay: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("sqlkv-flush-timer".to_string())
        .spawn(move || run(rx, core, delay))
}

fn run(rx: Receiver<TimerMsg>, core: Weak<Core>, delay: Duration) {
    let mut deadline: Option<Instant> = None;

    loop {
        let msg = match deadline {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match msg {
            Ok(TimerMsg::Arm) => {
                if deadline.is_none() {
                    deadline = Some(Instant::now() + delay);
                }
            }
            Ok(TimerMsg::Disarm) => deadline = None,
            Ok(TimerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                match core.upgrade() {
                    Some(core) => core.on_timer(),
                    None => break,
                }
            }
        }
    }

    tracing::trace!("flush timer stopped");
}
