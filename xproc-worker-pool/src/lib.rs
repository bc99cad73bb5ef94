//! # xproc worker pool
//!
//! Bounded thread pool used by the xproc RPC host to read and dispatch incoming frames.
//!
//! Work goes through two steps: [Worker::take_work] captures a unit from some
//! (possibly blocking) input source, and [Worker::perform_work] processes it.
//! At most one worker is ever inside the capture step, while processing runs
//! on as many threads as needed. Idle threads above `min_workers` exit and are
//! joined by a dedicated reaper thread.
//!
//! # Examples
//! ```rust
//! use std::time::Duration;
//!
//! use crossbeam_channel::{unbounded, Receiver};
//! use xproc_worker_pool::{Capture, PoolConfig, WorkError, Worker, WorkerPool};
//!
//! struct Printer {
//!     input: Receiver<String>,
//! }
//!
//! impl Worker for Printer {
//!     type Work = String;
//!
//!     fn take_work(&mut self) -> Capture<String> {
//!         match self.input.recv_timeout(Duration::from_millis(50)) {
//!             Ok(line) => Capture::Work(line),
//!             Err(_) => Capture::Empty,
//!         }
//!     }
//!
//!     fn perform_work(&mut self, line: String) -> Result<(), WorkError> {
//!         println!("{line}");
//!         Ok(())
//!     }
//! }
//!
//! let (sender, receiver) = unbounded();
//! let mut pool = WorkerPool::new(PoolConfig::default(), move || Printer {
//!     input: receiver.clone(),
//! })
//! .unwrap();
//!
//! sender.send("Hello!".to_owned()).unwrap();
//! pool.finish();
//! ```
mod error;
pub mod pool;
pub mod worker;

pub use error::*;
pub use pool::{PoolConfig, PoolStats, WorkerId, WorkerPool};
pub use worker::{Capture, WorkError, Worker};
