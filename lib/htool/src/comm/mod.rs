//! Communication engine for HANTAS torque tools.
//!
//! The modules in here turn asynchronous byte deliveries from a serial port
//! or TCP socket into classified protocol frames, and drive outbound
//! requests through a keyed, deduplicating, retrying queue with
//! at-most-one-inflight semantics.

pub mod buffer;
pub mod queue;
pub mod frame;
pub mod message;
pub mod shared;
pub mod ingress;
pub mod link;
pub mod serial;
pub mod tcp;
pub mod payload;
pub mod endpoint;
