//! Processor implementations for the fluxweld library.
//!
//! A processor is both a [`Subscriber`](crate::core::Subscriber) and a
//! [`Publisher`](crate::core::Publisher): signals pushed into one end come out of the
//! other under the downstream's demand.

pub mod unicast;

pub use unicast::UnicastProcessor;
