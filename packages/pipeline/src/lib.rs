//! Event pipeline for the credit ledger.
//!
//! A producer task per bus subscription pulls `(topic, body, ack)`
//! deliveries into a bounded channel; a pool of processor workers decodes,
//! validates and dispatches them to the owning user actor via the cluster
//! router, then translates the outcome into ack (done, or poison) or nack
//! (transient, redeliver).

mod bus;
mod processor;
mod producer;

pub use bus::{AckHandle, Acker, BusSubscription, Delivery, InMemoryBus, InMemorySubscription};
pub use processor::{
    PipelineConfig, PipelineHandle, TOPIC_ENTITLEMENTS, TOPIC_JOBS_COMPLETE, process_delivery,
    start,
};
