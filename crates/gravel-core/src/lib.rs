//! # Gravel Core
//!
//! Host-side engine for streaming element sequences through a
//! command-queue compute device (the OpenCL family): chunked uploads,
//! cached program compilation, map and two-stage reduce dispatch, and
//! windowed read-back, all chained through explicit completion events.
//!
//! ```text
//! host producer ──▶ ChunkStream ──▶ Chunk<T> ──▶ map_chunk ──▶ Chunk<B>
//!                                      │                          │
//!                                      ▼                          ▼
//!                                 ChunkReader               reduce_chunk
//!                                 (host values)            (async scalar)
//! ```
//!
//! Causal ordering between commands is expressed exclusively through
//! event dependency lists; the host blocks only at mapping boundaries and
//! at the final result decode. Ownership of every device handle is
//! balanced against the API's reference counting on every path, including
//! failure and cancellation; the [`stub`] backend counts and can prove
//! it.
//!
//! The real device binding lives in the `gravel-cl` crate; this crate is
//! backend-agnostic over the [`api::DeviceApi`] trait.
//!
//! ## Example
//!
//! ```ignore
//! use gravel_core::prelude::*;
//!
//! let session = gravel_cl::open_session(SessionOptions::default())?;
//! let mut chunks = session.stream(U32Codec, 0u32..1_000_000)?;
//! while let Some(chunk) = chunks.next() {
//!     let chunk = chunk?;
//!     let total = session.reduce_chunk(&chunk, U32Codec, &sum_source)?.wait()?;
//!     println!("chunk sum: {total}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod cache;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod handle;
pub mod pool;
pub mod reduce;
pub mod session;
pub mod source;
pub mod stream;
pub mod stub;

pub use api::{
    BufferKind, CompletionCallback, DeviceApi, DeviceProbe, EventId, HostBlock, KernelArg,
    KernelId, MapMode, MappedRegion, MemId, NdRange, ProgramId,
};
pub use cache::{ProgramCache, ProgramHandle};
pub use chunk::{Chunk, ChunkReader};
pub use codec::{ElementCodec, F32Codec, F64Codec, U32Codec, U64Codec};
pub use error::{GravelError, Result};
pub use handle::{safe_release_event, DeviceBuffer, Event};
pub use pool::{DustBuffer, DustPool};
pub use reduce::ReduceFuture;
pub use session::{new_session, Session, SessionOptions, MAP_KERNEL, REDUCE_KERNEL};
pub use source::{KernelSource, StaticSource};
pub use stream::ChunkStream;

/// Convenient imports for engine users.
pub mod prelude {
    pub use crate::api::{DeviceApi, DeviceProbe, KernelArg, NdRange};
    pub use crate::chunk::{Chunk, ChunkReader};
    pub use crate::codec::{ElementCodec, F32Codec, F64Codec, U32Codec, U64Codec};
    pub use crate::error::{GravelError, Result};
    pub use crate::reduce::ReduceFuture;
    pub use crate::session::{new_session, Session, SessionOptions};
    pub use crate::source::{KernelSource, StaticSource};
}
