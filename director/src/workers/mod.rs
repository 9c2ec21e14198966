//! Background workers

pub mod notifications;
pub mod poller;
