//! End-to-end tests for claw-notify.
//!
//! These tests drive the public API the way a host would:
//! - Wrapped invocations that fail, panic or log errors
//! - Immediate and batched delivery against a recording transport
//! - Nested and concurrent invocations
//! - Transport and configuration failures

#![cfg(test)]
