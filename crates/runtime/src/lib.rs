//! Coordination and memory subsystem: the chat reasoning loop, its context
//! manager, and the sleep-time memory-curation scheduler (spec §4.4–§4.6).

pub mod chat;
pub mod context;
pub mod sleep;
mod turn;

pub use chat::{ChatLoop, TransportChunk};
pub use sleep::{MemoryTask, Scheduler, SchedulerHandle, SchedulerParams, SchedulerState, SystemEvent, SystemEventKind};
