//! Test harness for hypervisor integration tests
//!
//! Runs the registration service on a temporary socket directory and
//! provides builders for LISP control packets and mapping messages.

#![allow(dead_code)]

pub mod hypervisor;
pub mod packets;

pub use hypervisor::{Hypervisor, Recorder, pump, settle};
