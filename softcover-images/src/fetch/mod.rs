//! Network side of the pipeline: transport, retry, coalescing.

mod coalesce;
mod retry;
mod transport;

pub use coalesce::{CoalescerStats, RequestCoalescer};
pub use retry::{RetryPolicy, fetch_with_retry};
pub use transport::{ByteStream, HttpTransport, ImageTransport, StreamedBody};
