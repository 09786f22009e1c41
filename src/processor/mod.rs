pub mod bulk;
pub mod engine;
pub mod feature_processor;
pub mod flow;
pub mod key;
pub mod publisher;
pub mod record;
pub mod spill;
pub mod stats;
pub mod table;

pub use engine::RunStatus;
pub use feature_processor::{FeatureProcessor, ProcessingReport};
pub use flow::FlowAggregate;
pub use key::{FlowDirection, FlowKey};
pub use publisher::{CancellationToken, ProgressCallback};
pub use record::{columns, finalize, FieldValue, FlowRecord, FEATURE_COLUMNS, KEY_COLUMNS};
pub use stats::SampleStorage;
pub use table::FlowTable;
