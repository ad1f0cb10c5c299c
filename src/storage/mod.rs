//! Recording storage
//!
//! One directory holds every finished recording, named by capture time.
//! There is no manifest: the directory listing is the source of truth.

mod paths;

pub use paths::{list_recordings, platform_root, PathResolver};
