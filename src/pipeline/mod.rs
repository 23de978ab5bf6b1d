//! Threading primitives shared by the conversion and missing-object
//! pipelines: cancel tokens, cancellable queue operations, work tickets,
//! and fail-fast worker pools.

pub mod cancel;
pub mod pool;
pub mod queue;
pub mod tickets;

pub use cancel::CancelToken;
pub use pool::WorkerPool;
pub use tickets::{Ticket, WorkTickets};
