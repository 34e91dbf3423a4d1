pub mod cleaner;
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod index;
pub mod iter;
pub mod keyspace;
pub mod layer;
pub mod schema;
pub mod store;
pub mod value;

pub use config::DataConfig;
pub use error::{Error, Result};
pub use iter::{AttributeCheck, DataIterator, ObjectRangeIter, Predicate, SearchIter};
pub use layer::DataLayer;
pub use schema::{
    AttrType, Attribute, CaptureId, RegionId, SavedState, Schema, ServerId, Subspace, Topology,
    TransferSink,
};
pub use store::{Reference, SetupState, Snapshot};
