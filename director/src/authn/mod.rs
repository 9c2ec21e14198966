//! Credentials and proxy authentication

pub mod credentials;
pub mod proxy_token;
