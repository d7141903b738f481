//! The byte exact surface exchanged with the hub: topic strings, desired and
//! reported twin documents and command payloads.
//!
//! Everything in this crate is pure, the session decides what to publish.

pub mod command;
pub mod topic;
pub mod twin;

pub use iotc_util::encode;

use iotc_util as util;
