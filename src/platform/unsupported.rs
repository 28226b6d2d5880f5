//! Stub backend for targets outside this crate's scope (macOS, Windows,
//! Android). Every operation reports `UnsupportedPlatform`.

use std::collections::HashSet;

use crate::common::{ClipboardData, ClipboardFormat, Error};

pub(crate) mod wayland {
	pub(crate) struct Clipboard;

	impl Clipboard {
		pub(crate) fn wait_for_change(&mut self) -> Result<super::ClipboardData, super::Error> {
			Err(super::Error::UnsupportedPlatform)
		}
	}
}

pub(crate) struct Clipboard;

impl Clipboard {
	pub(crate) fn new() -> Result<Self, Error> {
		Err(Error::UnsupportedPlatform)
	}

	pub(crate) fn read(&mut self, _format: ClipboardFormat) -> Result<ClipboardData, Error> {
		Err(Error::UnsupportedPlatform)
	}

	pub(crate) fn read_auto(&mut self) -> Result<ClipboardData, Error> {
		Err(Error::UnsupportedPlatform)
	}

	pub(crate) fn write(&mut self, _bytes: &[u8], _format: ClipboardFormat) -> Result<(), Error> {
		Err(Error::UnsupportedPlatform)
	}

	pub(crate) fn clear(&mut self) -> Result<(), Error> {
		Err(Error::UnsupportedPlatform)
	}

	pub(crate) fn available_formats(&mut self) -> Result<HashSet<ClipboardFormat>, Error> {
		Err(Error::UnsupportedPlatform)
	}

	pub(crate) fn wayland_backend_mut(&mut self) -> Result<&mut wayland::Clipboard, Error> {
		Err(Error::UnsupportedPlatform)
	}
}
