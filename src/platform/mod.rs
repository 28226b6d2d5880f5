//! Platform dispatcher: detects the desktop session and forwards every
//! `Clipboard` operation to whichever backend is active.

#[cfg(all(unix, not(any(target_os = "macos", target_os = "android", target_os = "emscripten"))))]
mod linux;
#[cfg(all(unix, not(any(target_os = "macos", target_os = "android", target_os = "emscripten"))))]
pub use linux::*;

// macOS, Windows, Android, and anything else are out of scope for this
// crate. This stub exists only so the crate compiles on those targets; it
// never selects a working backend.
#[cfg(not(all(unix, not(any(target_os = "macos", target_os = "android", target_os = "emscripten")))))]
mod unsupported;
#[cfg(not(all(unix, not(any(target_os = "macos", target_os = "android", target_os = "emscripten")))))]
pub use unsupported::*;
