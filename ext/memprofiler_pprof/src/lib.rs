extern crate serde;
#[macro_use]
extern crate serde_derive;

#[cfg(feature = "ruby")]
mod ruby_init;
#[cfg(feature = "ruby")]
mod ruby_host;

pub mod collector;
pub mod error;
pub mod fork;
pub mod heap_index;
pub mod host;
pub mod ledger;
pub mod location_table;
pub mod lock;
pub mod sample;
pub mod serialization;
pub mod string_table;
mod util;

#[cfg(test)]
mod testing;

pub use collector::configuration::{BacktraceMethod, Configuration};
pub use collector::{Collector, FlushResult, FlushStats};
pub use error::{CollectorError, ConfigurationError, HostError, SerializationError};
pub use host::{CapturedFrame, Host, ObjectHandle};
