// Events Module
// Named-event bus and structured execution records

pub mod bus;
pub mod records;

pub use bus::{Event, EventBus, EventListener, ListenerId};
pub use records::{
    record_channel, LogRecord, RecordKind, RecordReceiver, RecordResult, RecordSender, RecordSink,
};
