//! Observability
//!
//! Structured events keyed by pip identity, and process dumps.

pub mod dump;
pub mod events;

pub use dump::{ProcessDumper, ProcfsDumper};
pub use events::{
    EventSeverity, EventSink, LogEventSink, MemoryEventSink, SandboxEvent, SandboxEventKind,
};
