//! Shared types used by every backend: the clipboard format enum, the owned
//! data buffer produced by a read, the error taxonomy, and the MIME name
//! tables the backends use to negotiate formats.

use std::fmt;

/// One of the four logical clipboard contents this crate understands.
///
/// This is a closed enumeration: there is no `Other` variant. A backend that
/// cannot map an offered MIME type or X atom to one of these four formats
/// simply does not add it to `available_formats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipboardFormat {
	Text,
	Image,
	Html,
	Rtf,
}

/// Canonical MIME string for a format, used when writing and as the single
/// MIME the receive side reports for `Image`/`Html`/`Rtf`.
pub fn format_to_mime(format: ClipboardFormat) -> &'static str {
	match format {
		ClipboardFormat::Text => "text/plain",
		ClipboardFormat::Image => "image/png",
		ClipboardFormat::Html => "text/html",
		ClipboardFormat::Rtf => "application/rtf",
	}
}

/// All aliases a write should offer for `format`, in the exact wire order
/// used for Wayland text writes. Non-text formats offer only the canonical
/// MIME.
pub fn format_to_offered_mimes(format: ClipboardFormat) -> &'static [&'static str] {
	match format {
		ClipboardFormat::Text => {
			&["text/plain", "text/plain;charset=utf-8", "TEXT", "STRING", "UTF8_STRING"]
		}
		ClipboardFormat::Image => &["image/png"],
		ClipboardFormat::Html => &["text/html"],
		ClipboardFormat::Rtf => &["application/rtf"],
	}
}

/// Maps an offered/received MIME string to a logical format. Permissive on
/// legacy text aliases and the `image/*` family; `None` when nothing in the
/// closed enumeration matches.
pub fn mime_to_format(mime: &str) -> Option<ClipboardFormat> {
	match mime {
		"text/plain" | "text/plain;charset=utf-8" | "TEXT" | "STRING" | "UTF8_STRING" => {
			Some(ClipboardFormat::Text)
		}
		"text/html" => Some(ClipboardFormat::Html),
		"application/rtf" => Some(ClipboardFormat::Rtf),
		m if m.starts_with("image/") => Some(ClipboardFormat::Image),
		_ => None,
	}
}

/// The MIME this crate asks for specifically when fetching text: the only
/// alias among the text family that also names its encoding explicitly.
pub const PREFERRED_TEXT_MIME: &str = "text/plain;charset=utf-8";

/// The MIME this crate asks for specifically when fetching an image: the
/// only one ever offered on the write side, so it's the safest choice when
/// a peer's offer advertises several image MIMEs.
pub const PREFERRED_IMAGE_MIME: &str = "image/png";

/// Read priority used by `read_auto` everywhere except the X11 backend,
/// which inverts text and image to preserve binary fidelity.
pub const DEFAULT_FORMAT_PRIORITY: [ClipboardFormat; 4] =
	[ClipboardFormat::Text, ClipboardFormat::Image, ClipboardFormat::Html, ClipboardFormat::Rtf];

pub const X11_FORMAT_PRIORITY: [ClipboardFormat; 4] =
	[ClipboardFormat::Image, ClipboardFormat::Text, ClipboardFormat::Html, ClipboardFormat::Rtf];

/// An owned, immutable clipboard payload produced by a completed read.
///
/// Backends never hand out a reference to the payload they keep cached for
/// their own selection ownership; every read duplicates into a fresh
/// `ClipboardData`, which is what `Clone` does here.
#[derive(Debug, Clone)]
pub struct ClipboardData {
	bytes: Vec<u8>,
	format: ClipboardFormat,
}

impl ClipboardData {
	/// Constructs a new payload. An empty buffer is never a valid
	/// `ClipboardData`; callers should surface `Error::NoData` instead of
	/// calling this.
	pub(crate) fn new(bytes: Vec<u8>, format: ClipboardFormat) -> Result<Self, Error> {
		if bytes.is_empty() {
			return Err(Error::NoData);
		}
		Ok(Self { bytes, format })
	}

	pub fn format(&self) -> ClipboardFormat {
		self.format
	}

	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.bytes
	}
}

/// The exhaustive error taxonomy surfaced by every backend and the
/// dispatcher. Internal FFI/protocol failures are mapped into one of these
/// rather than leaking a library-specific error type.
#[derive(Debug)]
pub enum Error {
	InitializationFailed { description: String },
	UnsupportedPlatform,
	NoData,
	InvalidData,
	ReadFailed { description: String },
	WriteFailed { description: String },
	Timeout,
	OutOfMemory,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::InitializationFailed { description } => {
				write!(f, "failed to initialize the clipboard backend: {description}")
			}
			Error::UnsupportedPlatform => {
				write!(f, "no supported clipboard backend is available on this platform")
			}
			Error::NoData => write!(f, "the clipboard has no data in the requested format"),
			Error::InvalidData => write!(f, "the clipboard data does not match the requested format"),
			Error::ReadFailed { description } => write!(f, "failed to read the clipboard: {description}"),
			Error::WriteFailed { description } => write!(f, "failed to write the clipboard: {description}"),
			Error::Timeout => write!(f, "timed out waiting for the selection owner to respond"),
			Error::OutOfMemory => write!(f, "allocation failed while handling clipboard data"),
		}
	}
}

impl std::error::Error for Error {}

pub(crate) fn into_init_failed<E: fmt::Display>(error: E) -> Error {
	Error::InitializationFailed { description: error.to_string() }
}

pub(crate) fn into_read_failed<E: fmt::Display>(error: E) -> Error {
	Error::ReadFailed { description: error.to_string() }
}

pub(crate) fn into_write_failed<E: fmt::Display>(error: E) -> Error {
	Error::WriteFailed { description: error.to_string() }
}

/// Runs a closure when dropped, unless disarmed. Used to make sure cleanup
/// (deleting a tracked INCR requestor, resetting a one-shot flag) happens on
/// every exit path out of a read/write routine, including early returns from
/// `?`.
pub(crate) struct ScopeGuard<F: FnMut()> {
	cleanup: F,
	armed: bool,
}

impl<F: FnMut()> ScopeGuard<F> {
	pub(crate) fn new(cleanup: F) -> Self {
		Self { cleanup, armed: true }
	}

	pub(crate) fn disarm(&mut self) {
		self.armed = false;
	}
}

impl<F: FnMut()> Drop for ScopeGuard<F> {
	fn drop(&mut self) {
		if self.armed {
			(self.cleanup)();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const ALL_FORMATS: [ClipboardFormat; 4] =
		[ClipboardFormat::Text, ClipboardFormat::Image, ClipboardFormat::Html, ClipboardFormat::Rtf];

	#[test]
	fn mime_round_trip_is_idempotent() {
		for format in ALL_FORMATS {
			let mime = format_to_mime(format);
			assert_eq!(mime_to_format(mime), Some(format));
		}
	}

	#[test]
	fn text_aliases_all_map_to_text() {
		for alias in ["text/plain", "text/plain;charset=utf-8", "TEXT", "STRING", "UTF8_STRING"] {
			assert_eq!(mime_to_format(alias), Some(ClipboardFormat::Text));
		}
	}

	#[test]
	fn any_image_mime_maps_to_image() {
		for mime in ["image/png", "image/jpeg", "image/avif", "image/x-made-up"] {
			assert_eq!(mime_to_format(mime), Some(ClipboardFormat::Image));
		}
	}

	#[test]
	fn unknown_mime_maps_to_none() {
		assert_eq!(mime_to_format("application/octet-stream"), None);
	}

	#[test]
	fn empty_payload_is_no_data() {
		assert!(matches!(ClipboardData::new(Vec::new(), ClipboardFormat::Text), Err(Error::NoData)));
	}

	#[test]
	fn text_offers_five_aliases_in_wire_order() {
		assert_eq!(
			format_to_offered_mimes(ClipboardFormat::Text),
			&["text/plain", "text/plain;charset=utf-8", "TEXT", "STRING", "UTF8_STRING"]
		);
	}
}
