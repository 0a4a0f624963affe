// HOTPLUGD DELAYED WORK
// ONE WORKER THREAD, ONE PENDING DEADLINE, CYCLES NEVER OVERLAP.
//
// THE CYCLE CLOSURE RETURNS ITS OWN NEXT DELAY (SELF-RESCHEDULING).
// cancel_sync() DROPS THE PENDING DEADLINE, WAITS FOR AN IN-FLIGHT CYCLE TO
// DRAIN, AND SWALLOWS THAT CYCLE'S RESCHEDULE SO NOTHING FIRES AFTERWARDS.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{HotplugError, Result};

#[derive(Default)]
struct WorkState {
    deadline: Option<Instant>,
    running: bool,
    cancelling: u32,
    shutdown: bool,
    runs: u64,
}

struct Inner {
    state: Mutex<WorkState>,
    cond: Condvar,
}

pub struct DelayedWork {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedWork {
    pub fn spawn<F>(name: &str, mut work: F) -> Result<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let inner = Arc::new(Inner {
            state: Mutex::new(WorkState::default()),
            cond: Condvar::new(),
        });
        let worker = inner.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker, &mut work))
            .map_err(|e| HotplugError::Spawn("delayed work", e))?;
        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    // FALSE IF ALREADY PENDING OR SHUT DOWN
    pub fn queue(&self, delay: Duration) -> bool {
        let mut st = self.inner.state.lock();
        if st.shutdown || st.deadline.is_some() {
            return false;
        }
        st.deadline = Some(Instant::now() + delay);
        self.inner.cond.notify_all();
        true
    }

    // RETURNS TRUE IF A PENDING DEADLINE WAS DROPPED
    pub fn cancel_sync(&self) -> bool {
        let mut st = self.inner.state.lock();
        st.cancelling += 1;
        let was_pending = st.deadline.take().is_some();
        while st.running {
            self.inner.cond.wait(&mut st);
        }
        st.cancelling -= 1;
        self.inner.cond.notify_all();
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub fn runs(&self) -> u64 {
        self.inner.state.lock().runs
    }

    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock();
            st.shutdown = true;
            st.deadline = None;
            self.inner.cond.notify_all();
        }
        if let Some(h) = self.handle.lock().take() {
            if h.thread().id() != std::thread::current().id() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(inner: &Inner, work: &mut F)
where
    F: FnMut() -> Option<Duration>,
{
    let mut st = inner.state.lock();
    loop {
        if st.shutdown {
            return;
        }
        let Some(deadline) = st.deadline else {
            inner.cond.wait(&mut st);
            continue;
        };
        if Instant::now() < deadline {
            inner.cond.wait_until(&mut st, deadline);
            continue;
        }

        st.deadline = None;
        st.running = true;
        let next = MutexGuard::unlocked(&mut st, || work());
        st.running = false;
        st.runs += 1;

        if let Some(delay) = next {
            if st.cancelling == 0 && !st.shutdown && st.deadline.is_none() {
                st.deadline = Some(Instant::now() + delay);
            }
        }
        inner.cond.notify_all();
    }
}
