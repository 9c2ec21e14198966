//! Fleet notifications over MQTT

pub mod client;
pub mod topics;
