//! Crash-safe persistence helpers for the small JSON and text sidecar files
//! the runtime owns (pause lists, discovery caches, loop progress, install
//! markers).

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_json, atomic_write_text};
