//! Access-report pipeline: wire parsing, process correlation and aggregation.

pub mod aggregator;
pub mod channel;
pub mod encoder;
pub mod parser;
pub mod process_table;
pub mod types;

pub use aggregator::{
    AccessSets, MessageHandlingFlags, MessageProcessingFailure, ReportAggregator, ReportListener,
    ReportedFileAccess,
};
pub use channel::{MessageCountSemaphore, ReportChannel, REPORTS_FIFO_ENV};
pub use parser::AccessReportParser;
pub use process_table::{ProcessIndex, ProcessTable, ReportedProcess};
pub use types::*;
