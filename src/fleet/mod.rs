//! Device fleet bookkeeping: registry, inbound reconciliation and outbound
//! command construction.

pub mod dispatcher;
pub mod reconciler;
pub mod registry;
