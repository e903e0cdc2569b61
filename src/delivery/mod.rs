//! Mailbox discovery and in-order delivery.
//!
//! The [`OnlineObjectTracker`] polls the coordination store for online users
//! and active groups and keeps one [`DeliveryPump`] per mailbox. Each pump
//! hands fetched records to the [`Dispatcher`], which pushes them to the
//! gateway instances hosting the recipients.

mod dispatcher;
mod pump;
mod tracker;

pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, InstanceResolver};
pub use pump::{DeliveryPump, PumpContext, PumpError, PumpHandle, PumpOptions, PumpState};
pub use tracker::{OnlineObjectTracker, ReconcileReport};
