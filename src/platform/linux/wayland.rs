//! The `wlr-data-control` backend, with a `wl_data_device_manager` fallback
//! for compositors that don't expose the wlr protocol extension.
//!
//! Both device flavors drive the same state machine; `DeviceFlavor` picks
//! which proxy types back `current_offer`/`device` at any given time (a
//! tagged union instead of two nullable fields, enforcing "exactly one
//! active offer" at construction rather than by convention).
//!
//! The dispatch target (`ClipboardState`) is kept separate from the
//! `EventQueue` that drives it, since `wayland_client::EventQueue::roundtrip`
//! takes `&mut EventQueue` and `&mut D` as distinct borrows; embedding both
//! in one struct would make every dispatch call self-referential.

use std::{
	collections::{HashMap, HashSet},
	io::{Read as _, Write as _},
	os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd},
};

use log::warn;
use wayland_client::{
	backend::ObjectId,
	globals::{registry_queue_init, GlobalListContents},
	protocol::{
		wl_data_device::{self, WlDataDevice},
		wl_data_device_manager::WlDataDeviceManager,
		wl_data_offer::{self, WlDataOffer},
		wl_data_source::{self, WlDataSource},
		wl_registry::WlRegistry,
		wl_seat::WlSeat,
	},
	Connection, Dispatch, EventQueue, Proxy, QueueHandle,
};
use wayland_protocols_wlr::data_control::v1::client::{
	zwlr_data_control_device_v1::{self, ZwlrDataControlDeviceV1},
	zwlr_data_control_manager_v1::ZwlrDataControlManagerV1,
	zwlr_data_control_offer_v1::{self, ZwlrDataControlOfferV1},
	zwlr_data_control_source_v1::{self, ZwlrDataControlSourceV1},
};

use crate::common::{
	format_to_offered_mimes, into_init_failed, into_read_failed, into_write_failed, mime_to_format,
	ClipboardData, ClipboardFormat, Error, PREFERRED_IMAGE_MIME, PREFERRED_TEXT_MIME,
};

const READ_CHUNK: usize = 4096;

enum DeviceFlavor {
	Wlr { manager: ZwlrDataControlManagerV1, device: ZwlrDataControlDeviceV1 },
	Standard { manager: WlDataDeviceManager, device: WlDataDevice },
}

enum AnyOffer {
	Wlr(ZwlrDataControlOfferV1),
	Standard(WlDataOffer),
}

enum AnySource {
	Wlr(ZwlrDataControlSourceV1),
	Standard(WlDataSource),
}

/// Everything the registered `Dispatch` impls mutate. Lives apart from the
/// `EventQueue`/`Connection` that `Clipboard` also owns (see module docs).
struct ClipboardState {
	flavor: DeviceFlavor,

	current_offer: Option<AnyOffer>,
	offer_mimes: HashMap<ObjectId, Vec<String>>,
	available: Vec<String>,

	/// Sticky one-shot bit, reset at the start of every read/wait: sets when
	/// the compositor has answered with a (possibly null) selection.
	selection_received: bool,

	own: Option<(Vec<u8>, ClipboardFormat)>,
	active_sources: Vec<AnySource>,
}

impl ClipboardState {
	fn note_offer_mime(&mut self, offer_id: ObjectId, mime: String) {
		self.offer_mimes.entry(offer_id).or_default().push(mime);
	}

	fn adopt_offer(&mut self, offer: Option<AnyOffer>) {
		self.selection_received = true;
		self.available.clear();
		self.current_offer = match offer {
			Some(offer) => {
				let id = match &offer {
					AnyOffer::Wlr(o) => o.id(),
					AnyOffer::Standard(o) => o.id(),
				};
				if let Some(mimes) = self.offer_mimes.remove(&id) {
					self.available = mimes;
				}
				Some(offer)
			}
			None => None,
		};
	}

	fn available_formats(&self) -> HashSet<ClipboardFormat> {
		available_formats_from(&self.available)
	}

	/// First offered MIME that maps to `format`, preferring
	/// `PREFERRED_TEXT_MIME` for text.
	fn best_mime_for(&self, format: ClipboardFormat) -> Option<&str> {
		best_mime_for_available(&self.available, format)
	}
}

/// Deduplicated set of formats recognized among `available`'s offered MIMEs.
/// A free function (rather than a `ClipboardState` method body) so it can be
/// exercised without a live Wayland connection.
fn available_formats_from(available: &[String]) -> HashSet<ClipboardFormat> {
	available.iter().filter_map(|m| mime_to_format(m.as_str())).collect()
}

/// First offered MIME in `available` that maps to `format`, preferring
/// `PREFERRED_TEXT_MIME` for text and `PREFERRED_IMAGE_MIME` for images over
/// whatever happens to be listed first. See `available_formats_from`.
fn best_mime_for_available(available: &[String], format: ClipboardFormat) -> Option<&str> {
	if format == ClipboardFormat::Text && available.iter().any(|m| m.as_str() == PREFERRED_TEXT_MIME) {
		return Some(PREFERRED_TEXT_MIME);
	}
	if format == ClipboardFormat::Image && available.iter().any(|m| m.as_str() == PREFERRED_IMAGE_MIME) {
		return Some(PREFERRED_IMAGE_MIME);
	}
	available.iter().find(|m| mime_to_format(m.as_str()) == Some(format)).map(String::as_str)
}

impl Dispatch<WlRegistry, GlobalListContents> for ClipboardState {
	fn event(
		_: &mut Self,
		_: &WlRegistry,
		_: <WlRegistry as Proxy>::Event,
		_: &GlobalListContents,
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
	}
}

impl Dispatch<WlSeat, ()> for ClipboardState {
	fn event(
		_: &mut Self,
		_: &WlSeat,
		_: wayland_client::protocol::wl_seat::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
	}
}

impl Dispatch<WlDataDeviceManager, ()> for ClipboardState {
	fn event(
		_: &mut Self,
		_: &WlDataDeviceManager,
		_: wayland_client::protocol::wl_data_device_manager::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
	}
}

impl Dispatch<ZwlrDataControlManagerV1, ()> for ClipboardState {
	fn event(
		_: &mut Self,
		_: &ZwlrDataControlManagerV1,
		_: wayland_protocols_wlr::data_control::v1::client::zwlr_data_control_manager_v1::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
	}
}

impl Dispatch<WlDataDevice, ()> for ClipboardState {
	fn event(
		state: &mut Self,
		_device: &WlDataDevice,
		event: wl_data_device::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
		match event {
			wl_data_device::Event::DataOffer { id } => {
				state.offer_mimes.insert(id.id(), Vec::new());
			}
			wl_data_device::Event::Selection { id } => {
				state.adopt_offer(id.map(AnyOffer::Standard));
			}
			_ => {}
		}
	}
}

impl Dispatch<WlDataOffer, ()> for ClipboardState {
	fn event(
		state: &mut Self,
		offer: &WlDataOffer,
		event: wl_data_offer::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
		if let wl_data_offer::Event::Offer { mime_type } = event {
			state.note_offer_mime(offer.id(), mime_type);
		}
	}
}

impl Dispatch<WlDataSource, ()> for ClipboardState {
	fn event(
		state: &mut Self,
		_source: &WlDataSource,
		event: wl_data_source::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
		match event {
			wl_data_source::Event::Send { mime_type, fd } => state.serve_send(&mime_type, fd),
			wl_data_source::Event::Cancelled => state.retire_sources(),
			_ => {}
		}
	}
}

impl Dispatch<ZwlrDataControlDeviceV1, ()> for ClipboardState {
	fn event(
		state: &mut Self,
		_device: &ZwlrDataControlDeviceV1,
		event: zwlr_data_control_device_v1::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
		match event {
			zwlr_data_control_device_v1::Event::DataOffer { id } => {
				state.offer_mimes.insert(id.id(), Vec::new());
			}
			zwlr_data_control_device_v1::Event::Selection { id } => {
				state.adopt_offer(id.map(AnyOffer::Wlr));
			}
			_ => {}
		}
	}
}

impl Dispatch<ZwlrDataControlOfferV1, ()> for ClipboardState {
	fn event(
		state: &mut Self,
		offer: &ZwlrDataControlOfferV1,
		event: zwlr_data_control_offer_v1::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
		if let zwlr_data_control_offer_v1::Event::Offer { mime_type } = event {
			state.note_offer_mime(offer.id(), mime_type);
		}
	}
}

impl Dispatch<ZwlrDataControlSourceV1, ()> for ClipboardState {
	fn event(
		state: &mut Self,
		_source: &ZwlrDataControlSourceV1,
		event: zwlr_data_control_source_v1::Event,
		_: &(),
		_: &Connection,
		_: &QueueHandle<Self>,
	) {
		match event {
			zwlr_data_control_source_v1::Event::Send { mime_type, fd } => {
				state.serve_send(&mime_type, fd)
			}
			zwlr_data_control_source_v1::Event::Cancelled => state.retire_sources(),
			_ => {}
		}
	}
}

impl ClipboardState {
	fn serve_send(&mut self, mime_type: &str, fd: OwnedFd) {
		let Some((bytes, format)) = &self.own else { return };
		if mime_to_format(mime_type) != Some(*format) {
			return;
		}
		let mut file = std::fs::File::from(fd);
		if let Err(e) = file.write_all(bytes) {
			warn!("clipline: failed writing clipboard payload to requestor pipe: {e}");
		}
	}

	fn retire_sources(&mut self) {
		// A cancelled source means another client claimed the selection; we
		// no longer own it. The forked server process exits once it has
		// observed this for all its sources.
		self.active_sources.clear();
		self.own = None;
	}
}

/// The Wayland backend. Reads/writes/the change monitor run as the
/// requestor/owner on this struct's own connection; `write` forks into a
/// detached child exactly as the X11 backend does, and this struct
/// reconnects afterward rather than share the socket with the child.
pub(crate) struct Clipboard {
	conn: Connection,
	queue: EventQueue<ClipboardState>,
	qh: QueueHandle<ClipboardState>,
	state: ClipboardState,
}

impl Clipboard {
	pub(crate) fn new() -> Result<Self, Error> {
		let conn = Connection::connect_to_env().map_err(into_init_failed)?;
		let (globals, mut queue) = registry_queue_init::<ClipboardState>(&conn).map_err(into_init_failed)?;
		let qh = queue.handle();

		let seat: WlSeat = globals.bind(&qh, 1..=1, ()).map_err(into_init_failed)?;

		let flavor = if let Ok(manager) = globals.bind::<ZwlrDataControlManagerV1, _, _>(&qh, 2..=2, ())
		{
			let device = manager.get_data_device(&seat, &qh, ());
			DeviceFlavor::Wlr { manager, device }
		} else if let Ok(manager) = globals.bind::<WlDataDeviceManager, _, _>(&qh, 3..=3, ()) {
			let device = manager.get_data_device(&seat, &qh, ());
			DeviceFlavor::Standard { manager, device }
		} else {
			return Err(Error::InitializationFailed {
				description: "neither zwlr_data_control_manager_v1 nor wl_data_device_manager is available"
					.into(),
			});
		};

		let mut state = ClipboardState {
			flavor,
			current_offer: None,
			offer_mimes: HashMap::new(),
			available: Vec::new(),
			selection_received: false,
			own: None,
			active_sources: Vec::new(),
		};

		queue.roundtrip(&mut state).map_err(into_init_failed)?;

		Ok(Self { conn, queue, qh, state })
	}

	fn reconnect(&mut self) -> Result<(), Error> {
		*self = Self::new()?;
		Ok(())
	}

	/// Resets the sticky one-shot bits and blocks until the compositor
	/// answers with a (possibly null) selection, per the read state machine.
	fn ensure_fresh_offer(&mut self) -> Result<(), Error> {
		self.state.selection_received = false;
		self.state.available.clear();

		while !self.state.selection_received {
			self.queue.blocking_dispatch(&mut self.state).map_err(into_read_failed)?;
		}
		Ok(())
	}

	pub(crate) fn read(&mut self, format: ClipboardFormat) -> Result<ClipboardData, Error> {
		if let Some((bytes, own_format)) = &self.state.own {
			if *own_format == format {
				return ClipboardData::new(bytes.clone(), format);
			}
			return Err(Error::InvalidData);
		}

		self.ensure_fresh_offer()?;

		if self.state.current_offer.is_none() {
			return Err(Error::NoData);
		}
		let mime = self
			.state
			.best_mime_for(format)
			.ok_or(Error::InvalidData)?
			.to_owned();

		self.fetch(&mime, format)
	}

	pub(crate) fn read_auto(&mut self) -> Result<ClipboardData, Error> {
		if let Some((bytes, own_format)) = &self.state.own {
			return ClipboardData::new(bytes.clone(), *own_format);
		}

		self.ensure_fresh_offer()?;
		if self.state.current_offer.is_none() {
			return Err(Error::NoData);
		}

		for format in crate::common::DEFAULT_FORMAT_PRIORITY {
			if let Some(mime) = self.state.best_mime_for(format) {
				let mime = mime.to_owned();
				return self.fetch(&mime, format);
			}
		}
		Err(Error::NoData)
	}

	fn fetch(&mut self, mime: &str, format: ClipboardFormat) -> Result<ClipboardData, Error> {
		let (read_fd, write_fd) = create_pipe()?;

		match (&self.state.current_offer, &self.state.flavor) {
			(Some(AnyOffer::Wlr(offer)), _) => offer.receive(mime.to_owned(), write_fd),
			(Some(AnyOffer::Standard(offer)), _) => offer.receive(mime.to_owned(), write_fd),
			(None, _) => return Err(Error::NoData),
		}

		self.queue.roundtrip(&mut self.state).map_err(into_read_failed)?;

		let mut file = std::fs::File::from(read_fd);
		let mut bytes = Vec::new();
		let mut chunk = [0u8; READ_CHUNK];
		loop {
			let n = file.read(&mut chunk).map_err(into_read_failed)?;
			if n == 0 {
				break;
			}
			bytes.extend_from_slice(&chunk[..n]);
		}

		ClipboardData::new(bytes, format)
	}

	pub(crate) fn write(&mut self, bytes: &[u8], format: ClipboardFormat) -> Result<(), Error> {
		self.state.own = Some((bytes.to_vec(), format));

		let source = match &self.state.flavor {
			DeviceFlavor::Wlr { manager, .. } => {
				let source = manager.create_data_source(&self.qh, ());
				for mime in format_to_offered_mimes(format) {
					source.offer((*mime).to_owned());
				}
				AnySource::Wlr(source)
			}
			DeviceFlavor::Standard { manager, .. } => {
				let source = manager.create_data_source(&self.qh, ());
				for mime in format_to_offered_mimes(format) {
					source.offer((*mime).to_owned());
				}
				AnySource::Standard(source)
			}
		};

		match (&self.state.flavor, &source) {
			(DeviceFlavor::Wlr { device, .. }, AnySource::Wlr(source)) => {
				device.set_selection(Some(source))
			}
			(DeviceFlavor::Standard { device, .. }, AnySource::Standard(source)) => {
				device.set_selection(Some(source), 0)
			}
			_ => unreachable!("source flavor always matches the active device flavor"),
		}

		self.state.active_sources.push(source);
		self.conn.flush().map_err(into_write_failed)?;

		// SAFETY: see the X11 backend's `write`; the same fork-then-serve
		// persistence model applies here per the write state machine.
		match unsafe { libc::fork() } {
			-1 => Err(Error::WriteFailed { description: "fork() failed".into() }),
			0 => self.run_server_child(),
			_pid => self.reconnect(),
		}
	}

	/// Entered only in the forked child. Never returns.
	fn run_server_child(&mut self) -> ! {
		redirect_stdio_to_dev_null();
		let _ = std::env::set_current_dir("/");

		loop {
			match self.queue.blocking_dispatch(&mut self.state) {
				Ok(_) => {
					if self.state.own.is_none() {
						std::process::exit(0);
					}
				}
				Err(_) => std::process::exit(1),
			}
		}
	}

	pub(crate) fn clear(&mut self) -> Result<(), Error> {
		self.state.own = None;
		self.state.active_sources.clear();
		match &self.state.flavor {
			DeviceFlavor::Wlr { device, .. } => device.set_selection(None),
			DeviceFlavor::Standard { device, .. } => device.set_selection(None, 0),
		}
		self.conn.flush().map_err(into_write_failed)
	}

	pub(crate) fn available_formats(&mut self) -> Result<HashSet<ClipboardFormat>, Error> {
		if let Some((_, format)) = &self.state.own {
			let mut set = HashSet::new();
			set.insert(*format);
			return Ok(set);
		}
		self.ensure_fresh_offer()?;
		Ok(self.state.available_formats())
	}

	/// Blocks until the compositor delivers a new selection, then reads it.
	pub(crate) fn wait_for_change(&mut self) -> Result<ClipboardData, Error> {
		self.ensure_fresh_offer()?;
		if self.state.current_offer.is_none() {
			return Err(Error::NoData);
		}
		for format in crate::common::DEFAULT_FORMAT_PRIORITY {
			if let Some(mime) = self.state.best_mime_for(format) {
				let mime = mime.to_owned();
				return self.fetch(&mime, format);
			}
		}
		Err(Error::NoData)
	}
}

fn create_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
	let mut fds = [0i32; 2];
	// SAFETY: `fds` is a valid pointer to two `libc::c_int`s; `pipe` fills
	// both or returns -1 without touching them.
	let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
	if rc != 0 {
		return Err(into_read_failed(std::io::Error::last_os_error()));
	}
	// SAFETY: both fds were just created by `pipe` above and are not owned
	// elsewhere.
	let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
	let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
	Ok((read_fd, write_fd))
}

fn redirect_stdio_to_dev_null() {
	if let Ok(dev_null) = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null") {
		let fd = dev_null.as_raw_fd();
		unsafe {
			libc::dup2(fd, 0);
			libc::dup2(fd, 1);
			libc::dup2(fd, 2);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn strings(mimes: &[&str]) -> Vec<String> {
		mimes.iter().map(|m| m.to_string()).collect()
	}

	#[test]
	fn text_priority_picks_utf8_charset_mime_when_offered() {
		// Offer includes the legacy TEXT alias and text/html, but the
		// explicit-encoding alias wins.
		let available = strings(&["TEXT", "text/plain;charset=utf-8", "text/html"]);
		assert_eq!(best_mime_for_available(&available, ClipboardFormat::Text), Some(PREFERRED_TEXT_MIME));
	}

	#[test]
	fn image_fallback_prefers_canonical_png_mime() {
		// Only image/png is ever offered on the write side, so prefer it on
		// read even when it isn't the first MIME in the offer.
		let available = strings(&["image/webp", "image/png"]);
		assert_eq!(best_mime_for_available(&available, ClipboardFormat::Image), Some("image/png"));
	}

	#[test]
	fn legacy_aliases_without_text_plain_still_resolve_to_text() {
		let available = strings(&["TEXT", "STRING"]);
		assert_eq!(best_mime_for_available(&available, ClipboardFormat::Text), Some("TEXT"));
	}

	#[test]
	fn missing_format_returns_none() {
		let available = strings(&["image/png"]);
		assert_eq!(best_mime_for_available(&available, ClipboardFormat::Rtf), None);
	}

	#[test]
	fn duplicate_mimes_in_offer_deduplicate_in_available_formats() {
		let available = strings(&["text/plain", "TEXT", "text/plain", "image/png"]);
		let formats = available_formats_from(&available);
		assert_eq!(formats.len(), 2);
		assert!(formats.contains(&ClipboardFormat::Text));
		assert!(formats.contains(&ClipboardFormat::Image));
	}

	#[test]
	fn empty_offer_has_no_available_formats() {
		assert!(available_formats_from(&[]).is_empty());
	}
}
