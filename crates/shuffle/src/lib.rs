//! Sorted-run storage, merging and fetch transport for the reduce-side shuffle.
//!
//! Key modules:
//! - [`codec`]: block framing and record encoding
//! - [`layout`]: producer output paths and spill file naming
//! - [`writer`] / [`reader`]: run writers and segment readers
//! - [`merger`]: bounded fan-in k-way merge and combiner support
//! - [`transport`]: fetch contract plus a local-directory implementation

pub mod codec;
pub mod layout;
pub mod merger;
pub mod reader;
pub mod transport;
pub mod writer;

pub use codec::{BlockHeader, Record};
pub use layout::*;
pub use merger::{
    bytewise_comparator, merge_segments, write_run, Combiner, Combining, KeyComparator,
    MergedStream, Segment,
};
pub use reader::{Backing, ProducerOutputReader, SegmentReader};
pub use transport::{
    open_with_retry, FetchBody, FetchHeader, FetchResponse, LocalDirTransport, MapOutputLocation,
    ShuffleTransport,
};
pub use writer::{write_run_file, PartitionWriter, RunStats, RunWriter};
