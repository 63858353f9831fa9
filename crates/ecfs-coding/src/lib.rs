//! ecfs Coding - Erasure coding schemes for segments
//!
//! This crate turns a segment into blocks and back, including degraded reads
//! and block repair at sub-block ("symbol") granularity.
//!
//! # Schemes
//!
//! - **Replication**: `n` full copies, any one serves a read
//! - **Striping**: `k` disjoint strips, no redundancy
//! - **Raid5**: `n - 1` data blocks plus one XOR parity block
//! - **ReedSolomon**: `k` data plus `m` parity blocks via `reed-solomon-simd`
//! - **Rdp**: row-diagonal parity with sub-block single-failure repair
//!
//! Every operation takes the segment size explicitly; block geometry is a
//! pure function of the scheme, its setting and that size.

pub mod block;
pub mod codec;
pub mod schemes;
pub mod sparse;

pub use block::Block;
pub use codec::{CodingEngine, CodingError};
pub use sparse::BlockMap;
