use std::collections::HashSet;

use log::{trace, warn};

use crate::common::{ClipboardData, ClipboardFormat, Error};

mod x11;

#[cfg(feature = "wayland-data-control")]
pub(crate) mod wayland;

#[cfg(not(feature = "wayland-data-control"))]
pub(crate) mod wayland {
	pub(crate) struct Clipboard;
	impl Clipboard {
		pub(crate) fn wait_for_change(&mut self) -> Result<super::ClipboardData, super::Error> {
			Err(super::Error::UnsupportedPlatform)
		}
	}
}

pub(crate) enum Clipboard {
	X11(x11::Clipboard),
	#[cfg(feature = "wayland-data-control")]
	Wayland(wayland::Clipboard),
}

impl Clipboard {
	pub(crate) fn new() -> Result<Self, Error> {
		let session_type =
			std::env::var("XDG_SESSION_TYPE").unwrap_or_default().to_ascii_lowercase();
		let display_set = std::env::var_os("DISPLAY").is_some();

		match session_type.as_str() {
			"wayland" => {
				#[cfg(feature = "wayland-data-control")]
				{
					match wayland::Clipboard::new() {
						Ok(backend) => {
							trace!("clipline: selected the Wayland data-control backend");
							return Ok(Self::Wayland(backend));
						}
						Err(e) => warn!(
							"clipline: Wayland backend initialization failed ({e}), falling back to X11"
						),
					}
				}
				if display_set {
					Ok(Self::X11(x11::Clipboard::new()?))
				} else {
					Err(Error::UnsupportedPlatform)
				}
			}
			"x11" => Ok(Self::X11(x11::Clipboard::new()?)),
			_ => {
				if display_set {
					Ok(Self::X11(x11::Clipboard::new()?))
				} else {
					Err(Error::UnsupportedPlatform)
				}
			}
		}
	}

	pub(crate) fn read(&mut self, format: ClipboardFormat) -> Result<ClipboardData, Error> {
		match self {
			Self::X11(cb) => cb.read(format),
			#[cfg(feature = "wayland-data-control")]
			Self::Wayland(cb) => cb.read(format),
		}
	}

	pub(crate) fn read_auto(&mut self) -> Result<ClipboardData, Error> {
		match self {
			Self::X11(cb) => cb.read_auto(),
			#[cfg(feature = "wayland-data-control")]
			Self::Wayland(cb) => cb.read_auto(),
		}
	}

	pub(crate) fn write(&mut self, bytes: &[u8], format: ClipboardFormat) -> Result<(), Error> {
		match self {
			Self::X11(cb) => cb.write(bytes, format),
			#[cfg(feature = "wayland-data-control")]
			Self::Wayland(cb) => cb.write(bytes, format),
		}
	}

	pub(crate) fn clear(&mut self) -> Result<(), Error> {
		match self {
			Self::X11(cb) => cb.clear(),
			#[cfg(feature = "wayland-data-control")]
			Self::Wayland(cb) => cb.clear(),
		}
	}

	pub(crate) fn available_formats(&mut self) -> Result<HashSet<ClipboardFormat>, Error> {
		match self {
			Self::X11(cb) => cb.available_formats(),
			#[cfg(feature = "wayland-data-control")]
			Self::Wayland(cb) => cb.available_formats(),
		}
	}

	pub(crate) fn wayland_backend_mut(&mut self) -> Result<&mut wayland::Clipboard, Error> {
		match self {
			#[cfg(feature = "wayland-data-control")]
			Self::Wayland(cb) => Ok(cb),
			#[allow(unreachable_patterns)]
			_ => Err(Error::UnsupportedPlatform),
		}
	}
}
