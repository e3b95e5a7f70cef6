// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logging for the daemon.
//!
//! A `Logger` is a cheap clonable handle passed into every component at
//! construction. Messages are tagged with a `Facility` naming the component
//! and a `Severity`. Debug messages are gated per handle so an interface or
//! host with `debug = true` in the configuration can be traced without
//! turning on debug output for the whole daemon.

mod facility;
mod logger;
mod macros;
mod severity;

pub use facility::Facility;
pub use logger::Logger;
pub use severity::Severity;
