//! In-process caches

pub mod compose_path;
