//! sandgrid bin-packing allocator.
//!
//! One pure function, [`allocate`], decides which pending tasks run in the
//! next round on a given capacity. The server-side dequeue endpoint runs it
//! against the global queue; each foreman re-runs it against its precise
//! local capacity. It performs no I/O.
//!
//! # Components
//!
//! - **`allocator`** — the admission walk and capacity accounting
//! - **`schedulable`** — the trait candidates implement

pub mod allocator;
pub mod schedulable;

pub use allocator::{Admission, Allocation, allocate};
pub use schedulable::Schedulable;
