//! Core runtime types for the Keel virtual machine
//!
//! This crate holds everything the interpreter and the host embedding share:
//! the tagged [`value::Value`] model, [`types`] descriptors with the numeric
//! conversion rules, the lexically-chained [`env::Environment`], and the
//! [`runtime::TaskRuntime`] the VM delegates parallel work to.

pub mod env;
pub mod runtime;
pub mod types;
pub mod value;

pub use env::Environment;
pub use runtime::{ChannelId, TaskId, TaskRuntime};
pub use types::{Type, TypeTag};
pub use value::{ErrorValue, Value, ValueError, ValueResult};
