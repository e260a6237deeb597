// Storage layer: the KvStore facade and the partitioned log-structured
// engine behind it.

pub mod engine;
pub mod logfile;
pub mod partitioned;

pub use engine::{KvStore, WriteBatch};
pub use partitioned::PartitionedStore;
