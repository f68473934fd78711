//! Gauge callback sampling.
//!
//! Gauge callbacks are application code running on the pipeline's collection thread, so every invocation is isolated:
//! panics are caught, observations are buffered and only published once the callback returns, and, when a timeout is
//! configured, the callback runs on the provider's sampler thread that the collection thread waits on for at most that
//! long.

use std::{
    any::Any,
    cell::RefCell,
    io, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};
use opentelemetry::metrics::AsyncInstrument;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::CallbackFailure;

/// A gauge callback, as stored in the scope's instrument table.
pub(crate) type GaugeCallback<T> = dyn Fn(&Observations<T>) + Send + Sync;

type SampleResult<T> = Result<Vec<Observation<T>>, CallbackFailure>;

type Job = Box<dyn FnOnce() + Send>;

struct Observation<T> {
    value: T,
    attributes: Vec<KeyValue>,
}

/// Reporting handle passed to gauge callbacks.
///
/// A callback may report any number of data points, typically one per attribute set. Nothing reported here is visible
/// to the pipeline until the callback has returned.
pub struct Observations<T> {
    points: RefCell<Vec<Observation<T>>>,
}

impl<T> Observations<T> {
    fn new() -> Self {
        Self { points: RefCell::new(Vec::new()) }
    }

    /// Reports the current value of the gauge.
    pub fn observe(&self, value: T) {
        self.observe_with(value, &[]);
    }

    /// Reports the current value of the series identified by `attributes`.
    pub fn observe_with(&self, value: T, attributes: &[KeyValue]) {
        self.points.borrow_mut().push(Observation { value, attributes: attributes.to_vec() });
    }

    /// Returns the number of data points reported so far.
    pub fn len(&self) -> usize {
        self.points.borrow().len()
    }

    /// Returns `true` if nothing has been reported yet.
    pub fn is_empty(&self) -> bool {
        self.points.borrow().is_empty()
    }

    fn into_points(self) -> Vec<Observation<T>> {
        self.points.into_inner()
    }
}

struct Worker {
    generation: u64,
    jobs: Sender<Job>,
    handle: JoinHandle<()>,
}

enum PoolState {
    // No sampler thread yet, one is spawned on the next submission.
    Idle,
    Running(Worker),
    Stopped,
}

enum Submitted {
    Worker(u64),
    Inline,
}

/// Runs the gauge callbacks of one provider on a single sampler thread.
///
/// The thread is spawned on first use and shared by every gauge of every scope. A callback that overruns its time
/// budget keeps that thread occupied, so the thread is retired and a fresh one takes over for the remaining gauges. The
/// retired thread exits as soon as the overrunning callback returns.
///
/// Once [`stop`][SamplerPool::stop] has been called no thread is spawned anymore and every sample fails with
/// [`CallbackFailure::Disconnected`].
pub(crate) struct SamplerPool {
    timeout: Duration,
    state: Mutex<PoolState>,
    generations: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl SamplerPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(PoolState::Idle),
            generations: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the time budget of a single callback invocation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the number of sampler threads still alive, retired ones included.
    #[cfg(test)]
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn submit(&self, job: Job) -> Result<Submitted, CallbackFailure> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, PoolState::Idle) {
            match self.spawn_worker() {
                Ok(worker) => *state = PoolState::Running(worker),
                Err(e) => {
                    drop(state);
                    warn!(
                        error = %e,
                        "Failed to spawn gauge sampler thread, running callback inline without a time budget."
                    );
                    job();
                    return Ok(Submitted::Inline);
                }
            }
        }

        match &*state {
            PoolState::Running(worker) => {
                // The job channel is a rendezvous channel, so this only goes through once the sampler thread is idle
                // and waiting for work.
                worker.jobs.send_timeout(job, self.timeout).map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => CallbackFailure::Busy,
                    SendTimeoutError::Disconnected(_) => CallbackFailure::Disconnected,
                })?;
                Ok(Submitted::Worker(worker.generation))
            }
            PoolState::Idle | PoolState::Stopped => Err(CallbackFailure::Disconnected),
        }
    }

    /// Detaches the sampler thread of `generation` if it is still the current one.
    fn retire(&self, generation: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*state, PoolState::Running(worker) if worker.generation == generation) {
            // Dropping the worker closes its job channel, the thread exits once its current callback returns.
            *state = PoolState::Idle;
            debug!(generation, "Retired gauge sampler thread stuck on an overrunning callback.");
        }
    }

    /// Stops the current sampler thread and waits for it to exit.
    ///
    /// Retired threads are still running an overrunning callback and are not waited on.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            mem::replace(&mut *state, PoolState::Stopped)
        };

        if let PoolState::Running(Worker { jobs, handle, .. }) = previous {
            drop(jobs);
            if handle.join().is_err() {
                debug!("Gauge sampler thread panicked while stopping.");
            }
        }
    }

    fn spawn_worker(&self) -> io::Result<Worker> {
        let (jobs_tx, jobs_rx) = bounded::<Job>(0);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        self.live.fetch_add(1, Ordering::AcqRel);
        let live = Arc::clone(&self.live);
        let spawned = thread::Builder::new().name("metrics-exporter-otlp-gauge-sampler".to_string()).spawn(
            move || {
                let _live = LiveThread(live);
                for job in jobs_rx.iter() {
                    job();
                }

                debug!(generation, "Gauge sampler thread exiting.");
            },
        );

        match spawned {
            Ok(handle) => Ok(Worker { generation, jobs: jobs_tx, handle }),
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}

struct LiveThread(Arc<AtomicUsize>);

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// Clears a gauge's in-flight flag once its job has run, or was dropped without running.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum SamplerMode {
    // Run the callback on the collection thread itself.
    Inline,

    // Hand the callback to the provider's sampler thread and wait for it for at most the pool's timeout.
    Pooled { pool: Arc<SamplerPool>, in_flight: Arc<AtomicBool> },
}

/// Runs a gauge callback on behalf of the pipeline.
pub(crate) struct GaugeSampler<T> {
    name: Arc<str>,
    callback: Arc<GaugeCallback<T>>,
    mode: SamplerMode,
}

impl<T: Send + 'static> GaugeSampler<T> {
    /// Creates a sampler for the gauge `name`.
    ///
    /// With a `pool`, the callback runs on the pool's sampler thread under the pool's time budget. Otherwise it runs
    /// inline.
    pub fn new(name: &str, callback: Arc<GaugeCallback<T>>, pool: Option<Arc<SamplerPool>>) -> Self {
        let mode = match pool {
            None => SamplerMode::Inline,
            Some(pool) => SamplerMode::Pooled { pool, in_flight: Arc::new(AtomicBool::new(false)) },
        };

        Self { name: Arc::from(name), callback, mode }
    }

    fn sample(&self) -> SampleResult<T> {
        let (pool, in_flight) = match &self.mode {
            SamplerMode::Inline => return invoke(self.callback.as_ref()),
            SamplerMode::Pooled { pool, in_flight } => (pool, in_flight),
        };

        // An invocation left over from an earlier pass is never stacked on.
        if in_flight.swap(true, Ordering::AcqRel) {
            return Err(CallbackFailure::Busy);
        }

        let deadline = Instant::now() + pool.timeout();
        let (reply_tx, reply_rx) = bounded(1);
        let callback = Arc::clone(&self.callback);
        let guard = InFlight(Arc::clone(in_flight));
        let job: Job = Box::new(move || {
            let result = invoke(callback.as_ref());
            drop(guard);

            // The collection pass may have stopped waiting already.
            let _ = reply_tx.send(result);
        });

        let generation = match pool.submit(job)? {
            Submitted::Worker(generation) => generation,
            Submitted::Inline => {
                return reply_rx.try_recv().unwrap_or(Err(CallbackFailure::Disconnected));
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match reply_rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                pool.retire(generation);
                Err(CallbackFailure::TimedOut(pool.timeout()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CallbackFailure::Disconnected),
        }
    }

    /// Runs the callback once and publishes whatever it reported to `observer`.
    pub fn sample_into(&self, observer: &dyn AsyncInstrument<T>) {
        match self.sample() {
            Ok(points) => {
                for point in points {
                    observer.observe(point.value, &point.attributes);
                }
            }
            Err(failure) => warn!(
                instrument = %self.name,
                error = %failure,
                "Gauge callback failed, no data point reported for this collection pass."
            ),
        }
    }
}

fn invoke<T>(callback: &GaugeCallback<T>) -> SampleResult<T> {
    let observations = Observations::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&observations)));

    match outcome {
        Ok(()) => Ok(observations.into_points()),
        Err(payload) => Err(CallbackFailure::Panicked { message: panic_message(payload.as_ref()) }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
