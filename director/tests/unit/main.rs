//! Integration tests of the supercompose director

mod support;

mod test_connection;
mod test_containers;
mod test_engine;
mod test_lease;
mod test_poller;
mod test_server;
mod test_supervisor;
