//! Email processing pipeline.
//!
//! Every fetched message flows through:
//! 1. `ProcessorRegistry::dispatch()` picks the first matching processor
//! 2. `Processor::process()` decodes the body, extracts the code and notifies
//! 3. `ReadPolicy` decides whether the message may be flagged as seen
//!
//! Unmatched messages are left untouched.

pub mod extractor;
pub mod patterns;
pub mod processor;
pub mod registry;
pub mod types;

pub use extractor::{Extraction, NOT_FOUND_CODE};
pub use processor::{Processor, format_template};
pub use registry::{DEFAULT_MARK_READ_PROCESSORS, ProcessorRegistry, ReadPolicy};
pub use types::{BatchOutcome, DispatchOutcome};
