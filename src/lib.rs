//! Clipboard access for Linux desktops.
//!
//! [`Clipboard`] picks a backend at construction time: the Wayland
//! `wlr-data-control` protocol when a Wayland session is detected, falling
//! back to the X11 ICCCM selection protocol. See the crate's design
//! document for the full protocol-level contract.

mod common;
mod platform;

use std::collections::HashSet;

pub use common::{ClipboardData, ClipboardFormat, Error};

/// Entry point for every clipboard operation.
///
/// Not `Send`/`Sync`: both backends own a single display connection and must
/// only be driven from the thread that created them.
pub struct Clipboard {
	platform: platform::Clipboard,
}

impl Clipboard {
	/// Detects the desktop session and connects to the appropriate backend.
	///
	/// See the module documentation for the platform-selection rules.
	pub fn new() -> Result<Self, Error> {
		Ok(Self { platform: platform::Clipboard::new()? })
	}

	/// Reads the clipboard contents in the given format.
	///
	/// Fails with [`Error::InvalidData`] if the current offer does not
	/// advertise `format`, or [`Error::NoData`] if nothing currently owns the
	/// selection.
	pub fn read(&mut self, format: ClipboardFormat) -> Result<ClipboardData, Error> {
		self.platform.read(format)
	}

	/// Negotiates the best available format and reads it.
	///
	/// Priority is `text > image > html > rtf`, except on the X11 backend,
	/// which prefers `image > text` to avoid silently truncating binary
	/// payloads that also happen to offer a text representation.
	pub fn read_auto(&mut self) -> Result<ClipboardData, Error> {
		self.platform.read_auto()
	}

	/// Copies `bytes` onto the clipboard as `format`. `bytes` is copied; the
	/// caller may reuse or drop its buffer immediately on return.
	pub fn write(&mut self, bytes: &[u8], format: ClipboardFormat) -> Result<(), Error> {
		self.platform.write(bytes, format)
	}

	/// Releases ownership of the selection (and, on X11, `PRIMARY`).
	pub fn clear(&mut self) -> Result<(), Error> {
		self.platform.clear()
	}

	/// The deduplicated set of formats recognized from the most recent
	/// offer (or the backend's own cached format, if it owns the
	/// selection).
	pub fn available_formats(&mut self) -> Result<HashSet<ClipboardFormat>, Error> {
		self.platform.available_formats()
	}

	/// Starts the Wayland-only change monitor.
	///
	/// Returns [`Error::UnsupportedPlatform`] when the active backend is
	/// X11.
	pub fn start_wayland_monitor(&mut self) -> Result<Monitor<'_>, Error> {
		self.platform.wayland_backend_mut().map(|backend| Monitor { backend })
	}
}

/// A handle that blocks on selection-change notifications from the Wayland
/// compositor. Borrowed from the [`Clipboard`] that created it, since both
/// drive the same display connection.
pub struct Monitor<'a> {
	backend: &'a mut platform::wayland::Clipboard,
}

impl Monitor<'_> {
	/// Blocks until the compositor notifies a new selection, then reads it.
	///
	/// Every notified change produces one emission; identical consecutive
	/// payloads are not deduplicated.
	pub fn wait_for_change(&mut self) -> Result<ClipboardData, Error> {
		self.backend.wait_for_change()
	}
}
