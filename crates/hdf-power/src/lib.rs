//! `hdf-power` – per-device power state tokens and the asynchronous power
//! request queue.
//!
//! # Modules
//!
//! - [`token`] – [`PowerStateToken`][token::PowerStateToken]: wake-lock
//!   reference counting and system power event dispatch to a driver's
//!   [`PowerStateListener`][token::PowerStateListener].
//! - [`manager`] – [`PowerManager`][manager::PowerManager]: a single worker
//!   thread that executes queued acquire / release requests in FIFO order.

pub mod manager;
pub mod token;

pub use manager::{PowerManager, PowerRequest};
pub use token::{PowerStateListener, PowerStateToken};
