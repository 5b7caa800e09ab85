//! # GridLink Message Bus
//!
//! ## Purpose
//!
//! In-process publish/subscribe fabric over hierarchical slash-delimited
//! topics. This is the single integration surface between protocol adapters
//! and everything downstream: the push gateway, optimization consumers, and
//! storage ingesters all subscribe here, and adapters publish nowhere else.
//!
//! ## Integration Points
//!
//! - **Publishers**: protocol adapters (status/telemetry/events/command
//!   responses), adapter managers, the push gateway (commands)
//! - **Subscribers**: anything holding a [`MessageBus`] clone; wildcard
//!   filters `+` (one level) and trailing `#` (remainder)
//! - **Development**: [`MockBroker`] records publications and exposes an
//!   external listener API so adapters can be exercised without consumers
//!
//! ## Delivery Model
//!
//! Each subscription owns a bounded queue drained by its own tokio task, so a
//! slow or panicking subscriber can never stall the publisher or its
//! neighbors. Overflow sheds the oldest telemetry message in the queue;
//! status, command, command-response and event messages are never shed (the
//! queue grows past its soft bound for them). Per (publisher, subscriber)
//! ordering is FIFO. Delivery is in-process, at-most-once; there is no
//! persistence and no cross-process routing.

#![warn(clippy::all)]

mod fabric;
mod mock;
mod topic;

pub use fabric::{BusError, MessageBus, Publication, Result, SubscriptionHandle};
pub use mock::MockBroker;
pub use topic::matches;
