pub mod dispatch_worker;

pub use dispatch_worker::{DispatchWorker, WorkerError, WorkerHandle};
