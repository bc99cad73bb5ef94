use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// OS refused to start a worker or reaper thread
    #[error("Failed to spawn a pool thread: {0}")]
    SpawnFailed(String),
    /// Pool had been finished already
    #[error("Worker pool is finished")]
    Finished,
}

pub type Result<T> = std::result::Result<T, Error>;
