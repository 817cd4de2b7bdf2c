pub mod case;
pub mod counters;

pub use case::{AssignedDoctors, CaseDocument, CaseRecord, RecordError, TimestampValue};
pub use counters::{ClampedCounter, Counter, CounterDelta, CounterVector};
