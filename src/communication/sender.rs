//! Sender thread driving the sending state machine.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use super::context::SendingContext;
use super::state::SendingState;
use crate::error::Result;
use crate::util::lock;

/// Default time to wait for the sender thread on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct Worker {
    handle: JoinHandle<()>,
    done:   Receiver<()>,
}

pub struct BeaconSender {
    context: Arc<SendingContext>,
    worker:  Mutex<Option<Worker>>,
}

impl BeaconSender {
    pub fn new(context: Arc<SendingContext>) -> Self {
        BeaconSender { context, worker: Mutex::new(None) }
    }

    /// Spawn the sender thread. Returns `Ok(false)` if already started.
    pub fn initialize(&self) -> Result<bool> {
        let mut worker = lock(&self.worker);
        if worker.is_some() || self.context.is_shutdown_requested() {
            return Ok(false);
        }

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let context = Arc::clone(&self.context);
        let handle = thread::Builder::new()
            .name("BeaconSender".into())
            .spawn(move || {
                run_state_machine(&context);
                drop(done_tx);
            })?;

        *worker = Some(Worker { handle, done: done_rx });
        debug!("BeaconSender thread started");
        Ok(true)
    }

    /// Block until initialization completed; `None` waits indefinitely.
    pub fn wait_for_init(&self, timeout: Option<Duration>) -> bool {
        self.context.wait_for_init(timeout)
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_initialized()
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(SHUTDOWN_TIMEOUT)
    }

    /// Request shutdown and wait up to `timeout` for the thread to flush and
    /// terminate. Returns `true` if it terminated in time.
    pub fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        self.context.request_shutdown();

        let Some(worker) = lock(&self.worker).take() else {
            // never started: nobody else will release init waiters
            self.context.init_completed(false);
            return false;
        };

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("BeaconSender thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "BeaconSender thread did not stop within {timeout:?}, state {}",
                    self.context.current_state()
                );
                false
            }
        }
    }
}

/// Fails initialization when the sender thread exits, unwinding included,
/// unless a state already completed it.
struct InitGuard<'a>(&'a SendingContext);

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.0.init_completed(false);
    }
}

fn run_state_machine(ctx: &SendingContext) {
    let _init = InitGuard(ctx);
    let mut state = SendingState::initial();
    loop {
        ctx.set_current_state(state.name());
        if state.is_terminal() {
            break;
        }
        state = state.execute(ctx);
    }

    info!("BeaconSender thread is stopped");
}
