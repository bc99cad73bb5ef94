/// Error type returned by [Worker::perform_work]
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single [Worker::take_work] attempt
#[derive(Debug)]
pub enum Capture<T> {
    /// A unit of work was captured
    Work(T),
    /// Nothing available yet. The worker will retry
    Empty,
    /// The input source is broken. The worker exits
    Fatal(String),
}

/// A unit of a [crate::WorkerPool]. Every pool thread owns one worker
/// instance made by the pool factory.
///
/// The pool guarantees that only one of its workers is inside
/// [Worker::take_work] at a time, so an implementation may block there on a
/// shared input source without contention. It should return
/// [Capture::Empty] after a bounded interval, otherwise the pool can't finish
/// promptly.
pub trait Worker: Send + 'static {
    type Work: Send + 'static;

    /// Capture the next unit of work
    fn take_work(&mut self) -> Capture<Self::Work>;

    /// Process a captured unit. Runs concurrently with other workers
    fn perform_work(&mut self, work: Self::Work) -> Result<(), WorkError>;
}
