//! Scheduler Module
//!
//! Trigger evaluation loop and run dispatch.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, RegistrationError};
