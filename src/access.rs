//! Access layer: index structures built on top of the buffer pool.
//!
//! - **BPlusTree**: thread-safe B+Tree over fixed-size keys and record
//!   identifiers, with latch crabbing for concurrent readers and writers
//! - **Rid**: identifier of a tuple in the table heap, opaque to the index

pub mod btree;
pub mod rid;

pub use btree::BPlusTree;
pub use rid::Rid;
