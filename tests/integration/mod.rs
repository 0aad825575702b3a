//! Integration tests for revport
//!
//! These tests run a real broker and real clients over loopback TCP and
//! verify the behavior of whole sessions: registration, data bridging,
//! disconnect cleanup, reconciliation, and config pushes.
//!
//! # Test Organization
//!
//! - `session_integration`: session lifecycle, end-to-end bridging,
//!   handshake rejection, duplicate-id replacement, config push
//! - `reconcile_integration`: listener reconciliation across syncs and
//!   reconnects
//!
//! Each test uses its own `port_start` range so parallel tests never race
//! for public ports.

pub mod reconcile_integration;
pub mod session_integration;
mod support;
