use std::time::{Duration, Instant};

use crate::comm::frame::FunctionCode;

/// Sentinel for responses and messages without a meaningful register
/// address (device info, unsolicited frames).
pub const EMPTY_ADDR: u16 = 0xFFFF;

/// Timeout expiries a message survives before it is dropped.
pub const RETRY_BUDGET: u8 = 3;

/// De-duplication key of a message.
pub type MessageKey = (FunctionCode, u16);

/// A single outbound request tracked by the orchestrator queue: the
/// immutable encoded packet plus its transmission lifecycle.
#[derive(Debug, Clone)]
pub struct Message {
    code: FunctionCode,
    address: u16,
    packet: Vec<u8>,
    activated: bool,
    active_time: Instant,
    retry_budget: u8,
    fire_and_forget: bool,
}

impl Message {
    pub fn new(code: FunctionCode, address: u16, packet: Vec<u8>) -> Message {
        Message {
            code,
            address,
            packet,
            activated: false,
            active_time: Instant::now(),
            retry_budget: RETRY_BUDGET,
            fire_and_forget: false,
        }
    }

    /// A message that skips response correlation: it is dequeued as soon as
    /// the packet leaves the transport.
    pub fn fire_and_forget(code: FunctionCode, address: u16, packet: Vec<u8>) -> Message {
        Message { fire_and_forget: true, ..Message::new(code, address, packet) }
    }

    #[inline]
    pub fn key(&self) -> MessageKey {
        (self.code, self.address)
    }

    #[inline]
    pub fn code(&self) -> FunctionCode {
        self.code
    }

    #[inline]
    pub fn address(&self) -> u16 {
        self.address
    }

    #[inline]
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    #[inline]
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    #[inline]
    pub fn is_fire_and_forget(&self) -> bool {
        self.fire_and_forget
    }

    /// Marks the message as transmitted and awaiting its response.
    #[inline]
    pub fn activate(&mut self, now: Instant) {
        self.activated = true;
        self.active_time = now;
    }

    /// Clears the transmission mark so the next tick re-sends the packet.
    #[inline]
    pub fn deactivate(&mut self) {
        self.activated = false;
    }

    /// Time spent waiting for a response since the last transmission.
    #[inline]
    pub fn active_elapsed(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.active_time).unwrap_or_default()
    }

    /// Burns one retry; returns true while budget remains for a re-send.
    #[inline]
    pub fn consume_retry(&mut self) -> bool {
        self.retry_budget = self.retry_budget.saturating_sub(1);
        self.retry_budget > 0
    }
}
