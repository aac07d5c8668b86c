//! Cooperative cancellation shared by every loop
//!
//! Blocking ingestion threads poll `is_cancelled` once per iteration; async
//! tasks await `cancelled()`.

pub use tokio_util::sync::CancellationToken as ShutdownToken;
