//! `hdf-observer` – service discovery inside a device host.
//!
//! Maps a service name to its current publisher and the drivers waiting for
//! it.  Late subscribers to an already-published service are notified
//! synchronously, early subscribers are notified when the service appears.
//!
//! # Modules
//!
//! - [`observer`] – [`ServiceObserver`][observer::ServiceObserver]: the
//!   record map plus the publish / subscribe / withdraw / remove algorithms.

pub mod observer;

pub use observer::{ServiceCallback, ServiceObserver, SubscriberState, service_key};
