pub mod dead_letter;
pub mod persistence;
pub mod sequencer;

pub use dead_letter::{dead_letter_topic, DeadLetterRecord, DeadLetterSink, KafkaDeadLetterSink};
pub use persistence::PersistenceService;
pub use sequencer::SequenceAllocator;
