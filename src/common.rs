use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

/// Lock a mutex, carrying on with the inner data if another thread
/// panicked while holding it.
///
/// Jobs and probes run under `catch_unwind`, so a poisoned lock only
/// means some unrelated call blew up; the protected data is still
/// consistent because every critical section here is a single
/// assignment or collection update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Interruptible sleep shared between a background loop and whoever
/// owns its [`LoopHandle`].
#[derive(Clone, Default)]
pub(crate) struct ShutdownSignal(Arc<(Mutex<bool>, Condvar)>);

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn trigger(&self) {
        let (flag, cvar) = &*self.0;
        *lock(flag) = true;
        cvar.notify_all();
    }

    /// Sleep for `timeout` or until triggered.
    ///
    /// Returns `true` if the loop should stop.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.0;
        let deadline = Instant::now() + timeout;
        let mut stop = lock(flag);
        while !*stop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stop = cvar
                .wait_timeout(stop, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stop
    }
}

/// Owner's side of a background loop thread.
///
/// Dropping this detaches the thread; it keeps running for the rest of
/// the process. Call [`LoopHandle::shutdown`] to stop it.
pub struct LoopHandle {
    name: String,
    shutdown: ShutdownSignal,
    thread: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn new(name: String, shutdown: ShutdownSignal, thread: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            thread,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Interrupt the loop and wait for the thread to exit.
    pub fn shutdown(self) {
        self.shutdown.trigger();
        if self.thread.join().is_err() {
            tracing::error!(thread = %self.name, "Background loop panicked");
        }
    }
}

#[test]
fn wait_times_out_without_trigger() {
    let signal = ShutdownSignal::new();
    let start = Instant::now();
    assert!(!signal.wait(Duration::from_millis(20)));
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn trigger_interrupts_wait() {
    let signal = ShutdownSignal::new();
    let signal_t = signal.clone();
    let t = std::thread::spawn(move || signal_t.wait(Duration::from_secs(60)));
    std::thread::sleep(Duration::from_millis(10));
    signal.trigger();
    assert!(t.join().unwrap());
    assert!(signal.wait(Duration::ZERO));
}
