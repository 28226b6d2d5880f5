/*
SPDX-License-Identifier: Apache-2.0 OR MIT

Copyright 2022 The Arboard contributors

The project to which this file belongs is licensed under either of
the Apache 2.0 or the MIT license at the licensee's choice. The terms
and conditions of the chosen license apply to this file.
*/

// More info about using the clipboard on X11:
// https://tronche.com/gui/x/icccm/sec-2.html#s-2.6

use std::{
	collections::HashSet,
	io::Write as _,
	os::unix::io::AsRawFd as _,
	time::{Duration, Instant},
};

use x11rb::{
	connection::Connection,
	protocol::{
		xproto::{
			Atom, AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, Property,
			PropertyNotifyEvent, SelectionNotifyEvent, SelectionRequestEvent, Time, WindowClass,
		},
		Event,
	},
	rust_connection::RustConnection,
	wrapper::ConnectionExt as _,
	COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, NONE,
};

use crate::common::{into_init_failed, into_read_failed, into_write_failed, ClipboardData, ClipboardFormat, Error};

type Result<T, E = Error> = std::result::Result<T, E>;

x11rb::atom_manager! {
	pub Atoms: AtomCookies {
		CLIPBOARD,
		PRIMARY,
		TARGETS,
		INCR,

		UTF8_STRING,
		STRING,
		TEXT,
		TEXT_MIME: b"text/plain",
		HTML: b"text/html",
		RTF: b"application/rtf",

		PNG: b"image/png",
		JPEG: b"image/jpeg",
		GIF: b"image/gif",
		BMP: b"image/bmp",
		AVIF: b"image/avif",
		JXL: b"image/jxl",
		TIFF: b"image/tiff",
		WEBP: b"image/webp",

		// Property on our own window that a selection owner writes the
		// requested data into.
		XCLIP_OUT,
	}
}

const SELECTION_NOTIFY_TIMEOUT: Duration = Duration::from_millis(1000);
const INCR_TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const MIN_CHUNK_SIZE: usize = 4096;

const TEXT_TARGET_PREFERENCE: &[fn(&Atoms) -> Atom] =
	&[|a| a.UTF8_STRING, |a| a.TEXT_MIME, |a| a.STRING, |a| a.TEXT];
const IMAGE_TARGET_PREFERENCE: &[fn(&Atoms) -> Atom] = &[
	|a| a.AVIF,
	|a| a.WEBP,
	|a| a.JXL,
	|a| a.JPEG,
	|a| a.PNG,
	|a| a.TIFF,
	|a| a.GIF,
	|a| a.BMP,
];

fn atom_to_format(atoms: &Atoms, atom: Atom) -> Option<ClipboardFormat> {
	if atom == atoms.UTF8_STRING
		|| atom == atoms.STRING
		|| atom == atoms.TEXT
		|| atom == atoms.TEXT_MIME
	{
		Some(ClipboardFormat::Text)
	} else if atom == atoms.HTML {
		Some(ClipboardFormat::Html)
	} else if atom == atoms.RTF {
		Some(ClipboardFormat::Rtf)
	} else if atom == atoms.PNG
		|| atom == atoms.JPEG
		|| atom == atoms.GIF
		|| atom == atoms.BMP
		|| atom == atoms.AVIF
		|| atom == atoms.JXL
		|| atom == atoms.TIFF
		|| atom == atoms.WEBP
	{
		Some(ClipboardFormat::Image)
	} else {
		None
	}
}

/// The atom we request directly when the caller asks for a specific format.
fn format_to_request_atom(atoms: &Atoms, format: ClipboardFormat) -> Atom {
	match format {
		ClipboardFormat::Text => atoms.UTF8_STRING,
		ClipboardFormat::Image => atoms.PNG,
		ClipboardFormat::Html => atoms.HTML,
		ClipboardFormat::Rtf => atoms.RTF,
	}
}

/// Every atom this process will answer `SelectionRequest` for while it owns
/// the selection under `format`.
fn format_to_offered_atoms(atoms: &Atoms, format: ClipboardFormat) -> Vec<Atom> {
	match format {
		ClipboardFormat::Text => vec![atoms.UTF8_STRING, atoms.STRING, atoms.TEXT, atoms.TEXT_MIME],
		ClipboardFormat::Image => vec![atoms.PNG],
		ClipboardFormat::Html => vec![atoms.HTML],
		ClipboardFormat::Rtf => vec![atoms.RTF],
	}
}

struct XContext {
	conn: RustConnection,
	win_id: u32,
	atoms: Atoms,
	chunk_size: usize,
}

impl XContext {
	fn new() -> Result<Self> {
		let (conn, screen_num) = RustConnection::connect(None).map_err(into_init_failed)?;
		let screen = conn
			.setup()
			.roots
			.get(screen_num)
			.ok_or_else(|| Error::InitializationFailed {
				description: "X server reported no screens".into(),
			})?;
		let win_id = conn.generate_id().map_err(into_init_failed)?;

		conn.create_window(
			COPY_DEPTH_FROM_PARENT,
			win_id,
			screen.root,
			0,
			0,
			1,
			1,
			0,
			WindowClass::COPY_FROM_PARENT,
			COPY_FROM_PARENT,
			&CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE | EventMask::STRUCTURE_NOTIFY),
		)
		.map_err(into_init_failed)?;
		conn.flush().map_err(into_init_failed)?;

		let atoms = Atoms::new(&conn).map_err(into_init_failed)?.reply().map_err(into_init_failed)?;

		let chunk_size = (conn.maximum_request_bytes() / 4).max(MIN_CHUNK_SIZE);

		Ok(Self { conn, win_id, atoms, chunk_size })
	}
}

struct IncrRequestor {
	window: u32,
	property: Atom,
	target: Atom,
	cursor: usize,
}

/// The X11 ICCCM backend.
///
/// Reads and `TARGETS`/format-list queries run as the selection requestor on
/// this struct's own connection. Writes claim ownership on this connection,
/// then fork into a detached child that serves `SelectionRequest`s for as
/// long as it remains the owner; this struct reconnects to a fresh X11
/// client afterward so the calling process's own connection is never shared
/// with the child.
pub(crate) struct Clipboard {
	ctx: XContext,
	own: Option<(Vec<u8>, ClipboardFormat)>,
}

impl Clipboard {
	pub(crate) fn new() -> Result<Self> {
		Ok(Self { ctx: XContext::new()?, own: None })
	}

	pub(crate) fn read(&mut self, format: ClipboardFormat) -> Result<ClipboardData> {
		if let Some((bytes, own_format)) = &self.own {
			if *own_format == format {
				return ClipboardData::new(bytes.clone(), format);
			}
			return Err(Error::InvalidData);
		}

		let target = format_to_request_atom(&self.ctx.atoms, format);
		let bytes = self.request_and_fetch(target, format)?.0;
		ClipboardData::new(bytes, format)
	}

	pub(crate) fn read_auto(&mut self) -> Result<ClipboardData> {
		if let Some((bytes, own_format)) = &self.own {
			return ClipboardData::new(bytes.clone(), *own_format);
		}

		let targets = self.query_targets()?;

		for format in crate::common::X11_FORMAT_PRIORITY {
			let preference: &[fn(&Atoms) -> Atom] = match format {
				ClipboardFormat::Text => TEXT_TARGET_PREFERENCE,
				ClipboardFormat::Image => IMAGE_TARGET_PREFERENCE,
				ClipboardFormat::Html => &[|a: &Atoms| a.HTML],
				ClipboardFormat::Rtf => &[|a: &Atoms| a.RTF],
			};
			for candidate in preference {
				let atom = candidate(&self.ctx.atoms);
				if targets.contains(&atom) {
					let (bytes, inferred) = self.request_and_fetch(atom, format)?;
					return ClipboardData::new(bytes, inferred);
				}
			}
		}

		Err(Error::NoData)
	}

	pub(crate) fn write(&mut self, bytes: &[u8], format: ClipboardFormat) -> Result<()> {
		self.own = Some((bytes.to_vec(), format));

		self.ctx
			.conn
			.set_selection_owner(self.ctx.win_id, self.ctx.atoms.CLIPBOARD, Time::CURRENT_TIME)
			.map_err(into_write_failed)?;
		self.ctx.conn.flush().map_err(into_write_failed)?;

		let owner = self
			.ctx
			.conn
			.get_selection_owner(self.ctx.atoms.CLIPBOARD)
			.map_err(into_write_failed)?
			.reply()
			.map_err(into_write_failed)?
			.owner;
		if owner != self.ctx.win_id {
			return Err(Error::WriteFailed {
				description: "X server did not grant CLIPBOARD ownership".into(),
			});
		}

		// SAFETY: fork() is async-signal-safe on its own; we only perform
		// further syscalls (no allocator-unsafe operations) before either
		// branch returns or execs into the serve loop.
		match unsafe { libc::fork() } {
			-1 => Err(Error::WriteFailed { description: "fork() failed".into() }),
			0 => {
				// The forked child inherits this process's memory, including
				// `self.ctx.conn`'s file descriptor: fork() duplicates the
				// socket, not the X client, so the server still treats this as
				// the same connection and the window ID (allocated out of this
				// connection's XID range) stays valid there. A fresh
				// `RustConnection::connect` in the child would be handed a
				// different XID range and could not touch `win_id` at all.
				run_server_child(&self.ctx.conn, self.ctx.win_id, &self.ctx.atoms, self.ctx.chunk_size, bytes, format);
				unreachable!("run_server_child never returns")
			}
			_pid => {
				// The parent must not keep using this connection once a child
				// is serving requests on it, so it reconnects under a fresh XID
				// range rather than racing the child's serve loop.
				self.ctx = XContext::new()?;
				Ok(())
			}
		}
	}

	pub(crate) fn clear(&mut self) -> Result<()> {
		self.own = None;
		self.ctx
			.conn
			.set_selection_owner(NONE, self.ctx.atoms.CLIPBOARD, Time::CURRENT_TIME)
			.map_err(into_write_failed)?;
		self.ctx
			.conn
			.set_selection_owner(NONE, self.ctx.atoms.PRIMARY, Time::CURRENT_TIME)
			.map_err(into_write_failed)?;
		self.ctx.conn.flush().map_err(into_write_failed)?;
		Ok(())
	}

	pub(crate) fn available_formats(&mut self) -> Result<HashSet<ClipboardFormat>> {
		if let Some((_, format)) = &self.own {
			let mut set = HashSet::new();
			set.insert(*format);
			return Ok(set);
		}

		let targets = self.query_targets()?;
		Ok(targets.into_iter().filter_map(|atom| atom_to_format(&self.ctx.atoms, atom)).collect())
	}

	fn query_targets(&mut self) -> Result<Vec<Atom>> {
		let targets_atom = self.ctx.atoms.TARGETS;
		match self.request_and_fetch(targets_atom, ClipboardFormat::Text) {
			Ok((bytes, _)) => Ok(bytes
				.chunks_exact(4)
				.map(|c| Atom::from_ne_bytes([c[0], c[1], c[2], c[3]]))
				.collect()),
			Err(Error::NoData) => Ok(Vec::new()),
			Err(e) => Err(e),
		}
	}

	/// Requests `target` over `CLIPBOARD`, waits for the answer, and returns
	/// its bytes plus the format inferred from the *originally requested*
	/// target atom rather than the `INCR` property's own type, so a
	/// chunked transfer still reports the format it was fetched as.
	fn request_and_fetch(&mut self, target: Atom, requested_format: ClipboardFormat) -> Result<(Vec<u8>, ClipboardFormat)> {
		let conn = &self.ctx.conn;
		let win = self.ctx.win_id;
		let property = self.ctx.atoms.XCLIP_OUT;

		conn.delete_property(win, property).map_err(into_read_failed)?;
		conn.convert_selection(win, self.ctx.atoms.CLIPBOARD, target, property, Time::CURRENT_TIME)
			.map_err(into_read_failed)?;
		conn.flush().map_err(into_read_failed)?;

		let notify = wait_for_selection_notify(conn, win, SELECTION_NOTIFY_TIMEOUT)?;
		if notify.property == NONE {
			return Err(Error::NoData);
		}

		let probe = conn
			.get_property(false, win, property, AtomEnum::ANY, 0, 0)
			.map_err(into_read_failed)?
			.reply()
			.map_err(into_read_failed)?;

		if probe.type_ == self.ctx.atoms.INCR {
			let bytes = self.read_incr(property)?;
			let format = atom_to_format(&self.ctx.atoms, target).unwrap_or(requested_format);
			Ok((bytes, format))
		} else {
			let reply = conn
				.get_property(true, win, property, AtomEnum::ANY, 0, u32::MAX / 4)
				.map_err(into_read_failed)?
				.reply()
				.map_err(into_read_failed)?;
			if reply.value.is_empty() {
				return Err(Error::NoData);
			}
			let format = atom_to_format(&self.ctx.atoms, reply.type_).unwrap_or(requested_format);
			Ok((reply.value, format))
		}
	}

	fn read_incr(&self, property: Atom) -> Result<Vec<u8>> {
		let conn = &self.ctx.conn;
		let win = self.ctx.win_id;

		// Acknowledge the INCR announcement so the owner starts streaming.
		conn.delete_property(win, property).map_err(into_read_failed)?;
		conn.flush().map_err(into_read_failed)?;

		let mut bytes = Vec::new();
		let deadline = Instant::now() + INCR_TRANSFER_TIMEOUT;

		loop {
			wait_for_property_new_value(conn, win, property, deadline)?;

			let reply = conn
				.get_property(true, win, property, AtomEnum::ANY, 0, u32::MAX / 4)
				.map_err(into_read_failed)?
				.reply()
				.map_err(into_read_failed)?;

			if reply.value.is_empty() {
				break;
			}
			bytes.extend_from_slice(&reply.value);
		}

		Ok(bytes)
	}
}

fn wait_for_selection_notify(
	conn: &RustConnection,
	win: u32,
	timeout: Duration,
) -> Result<SelectionNotifyEvent> {
	let deadline = Instant::now() + timeout;
	loop {
		if let Some(event) = conn.poll_for_event().map_err(into_read_failed)? {
			if let Event::SelectionNotify(notify) = event {
				if notify.requestor == win {
					return Ok(notify);
				}
			}
		} else if Instant::now() >= deadline {
			return Err(Error::Timeout);
		} else {
			std::thread::sleep(POLL_INTERVAL);
		}
	}
}

fn wait_for_property_new_value(
	conn: &RustConnection,
	win: u32,
	property: Atom,
	deadline: Instant,
) -> Result<()> {
	loop {
		if let Some(event) = conn.poll_for_event().map_err(into_read_failed)? {
			if let Event::PropertyNotify(PropertyNotifyEvent { window, atom, state, .. }) = event {
				if window == win && atom == property && state == Property::NEW_VALUE {
					return Ok(());
				}
			}
		} else if Instant::now() >= deadline {
			return Err(Error::Timeout);
		} else {
			std::thread::sleep(POLL_INTERVAL);
		}
	}
}

/// Entered only in the forked child. Never returns: every exit path is a
/// `std::process::exit`, so errors in the serve loop terminate the child
/// silently rather than unwinding into the caller.
fn run_server_child(
	conn: &RustConnection,
	_win: u32,
	atoms: &Atoms,
	chunk_size: usize,
	payload: &[u8],
	format: ClipboardFormat,
) -> ! {
	redirect_stdio_to_dev_null();
	let _ = std::env::set_current_dir("/");

	let offered_atoms = format_to_offered_atoms(atoms, format);
	let mut requestors: Vec<IncrRequestor> = Vec::new();

	loop {
		let event = match conn.wait_for_event() {
			Ok(event) => event,
			Err(_) => std::process::exit(1),
		};

		match event {
			Event::SelectionClear(clear) if clear.selection == atoms.CLIPBOARD => {
				std::process::exit(0);
			}
			Event::SelectionRequest(request) => {
				if handle_selection_request(&conn, atoms, chunk_size, &offered_atoms, payload, &mut requestors, &request)
					.is_err()
				{
					std::process::exit(1);
				}
			}
			Event::PropertyNotify(notify) if notify.state == Property::DELETE => {
				if handle_incr_advance(&conn, chunk_size, payload, &mut requestors, &notify).is_err() {
					std::process::exit(1);
				}
			}
			_ => {}
		}
	}
}

fn handle_selection_request(
	conn: &RustConnection,
	atoms: &Atoms,
	chunk_size: usize,
	offered_atoms: &[Atom],
	payload: &[u8],
	requestors: &mut Vec<IncrRequestor>,
	request: &SelectionRequestEvent,
) -> Result<()> {
	if request.selection != atoms.CLIPBOARD {
		return deny(conn, request);
	}

	if request.target == atoms.TARGETS {
		let mut list = vec![atoms.TARGETS];
		list.extend_from_slice(offered_atoms);
		let words: Vec<u32> = list.into_iter().collect();
		conn.change_property32(
			x11rb::protocol::xproto::PropMode::REPLACE,
			request.requestor,
			request.property,
			AtomEnum::ATOM,
			&words,
		)
		.map_err(into_write_failed)?;
		return notify(conn, request, request.property);
	}

	if !offered_atoms.contains(&request.target) {
		return deny(conn, request);
	}

	if payload.len() <= chunk_size {
		conn.change_property8(
			x11rb::protocol::xproto::PropMode::REPLACE,
			request.requestor,
			request.property,
			request.target,
			payload,
		)
		.map_err(into_write_failed)?;
		notify(conn, request, request.property)
	} else {
		conn.change_property32(
			x11rb::protocol::xproto::PropMode::REPLACE,
			request.requestor,
			request.property,
			atoms.INCR,
			&[payload.len() as u32],
		)
		.map_err(into_write_failed)?;
		conn.change_window_attributes(
			request.requestor,
			&x11rb::protocol::xproto::ChangeWindowAttributesAux::new()
				.event_mask(EventMask::PROPERTY_CHANGE),
		)
		.map_err(into_write_failed)?;
		requestors.push(IncrRequestor {
			window: request.requestor,
			property: request.property,
			target: request.target,
			cursor: 0,
		});
		notify(conn, request, request.property)
	}
}

fn handle_incr_advance(
	conn: &RustConnection,
	chunk_size: usize,
	payload: &[u8],
	requestors: &mut Vec<IncrRequestor>,
	notify: &PropertyNotifyEvent,
) -> Result<()> {
	let Some(index) = requestors
		.iter()
		.position(|r| r.window == notify.window && r.property == notify.atom)
	else {
		return Ok(());
	};

	let (done, next_cursor) = {
		let requestor = &requestors[index];
		let remaining = payload.len() - requestor.cursor;
		let take = remaining.min(chunk_size);
		let chunk = &payload[requestor.cursor..requestor.cursor + take];

		conn.change_property8(
			x11rb::protocol::xproto::PropMode::REPLACE,
			requestor.window,
			requestor.property,
			requestor.target,
			chunk,
		)
		.map_err(into_write_failed)?;

		(take == 0, requestor.cursor + take)
	};

	if done {
		requestors.remove(index);
	} else {
		requestors[index].cursor = next_cursor;
	}
	conn.flush().map_err(into_write_failed)
}

fn deny(conn: &RustConnection, request: &SelectionRequestEvent) -> Result<()> {
	notify(conn, request, NONE)
}

fn notify(conn: &RustConnection, request: &SelectionRequestEvent, property: Atom) -> Result<()> {
	let event = SelectionNotifyEvent {
		response_type: x11rb::protocol::xproto::SELECTION_NOTIFY_EVENT,
		sequence: 0,
		time: request.time,
		requestor: request.requestor,
		selection: request.selection,
		target: request.target,
		property,
	};
	conn.send_event(false, request.requestor, EventMask::NO_EVENT, event)
		.map_err(into_write_failed)?;
	conn.flush().map_err(into_write_failed)
}

fn redirect_stdio_to_dev_null() {
	if let Ok(dev_null) = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null") {
		let fd = dev_null.as_raw_fd();
		unsafe {
			libc::dup2(fd, 0);
			libc::dup2(fd, 1);
			libc::dup2(fd, 2);
		}
		let _ = std::io::stdout().flush();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// Hand-rolled in place of a live `Atoms::new(&conn)` call: the macro's
	// fields are plain `pub Atom` (u32), so a fake set of distinct ids
	// exercises the mapping tables without a display connection.
	fn fake_atoms() -> Atoms {
		Atoms {
			CLIPBOARD: 1,
			PRIMARY: 2,
			TARGETS: 3,
			INCR: 4,
			UTF8_STRING: 5,
			STRING: 6,
			TEXT: 7,
			TEXT_MIME: 8,
			HTML: 9,
			RTF: 10,
			PNG: 11,
			JPEG: 12,
			GIF: 13,
			BMP: 14,
			AVIF: 15,
			JXL: 16,
			TIFF: 17,
			WEBP: 18,
			XCLIP_OUT: 19,
		}
	}

	#[test]
	fn offered_atoms_are_distinct_per_format() {
		assert_eq!(TEXT_TARGET_PREFERENCE.len(), 4);
		assert_eq!(IMAGE_TARGET_PREFERENCE.len(), 8);
	}

	#[test]
	fn every_text_alias_atom_maps_to_text() {
		let atoms = fake_atoms();
		for atom in [atoms.UTF8_STRING, atoms.STRING, atoms.TEXT, atoms.TEXT_MIME] {
			assert_eq!(atom_to_format(&atoms, atom), Some(ClipboardFormat::Text));
		}
	}

	#[test]
	fn every_image_atom_maps_to_image() {
		let atoms = fake_atoms();
		for atom in
			[atoms.PNG, atoms.JPEG, atoms.GIF, atoms.BMP, atoms.AVIF, atoms.JXL, atoms.TIFF, atoms.WEBP]
		{
			assert_eq!(atom_to_format(&atoms, atom), Some(ClipboardFormat::Image));
		}
	}

	#[test]
	fn unrecognized_atom_maps_to_none() {
		let atoms = fake_atoms();
		assert_eq!(atom_to_format(&atoms, atoms.TARGETS), None);
		assert_eq!(atom_to_format(&atoms, atoms.INCR), None);
	}

	#[test]
	fn offered_atoms_cover_every_text_alias_for_writes() {
		let atoms = fake_atoms();
		let offered = format_to_offered_atoms(&atoms, ClipboardFormat::Text);
		assert_eq!(offered.len(), 4);
		assert!(offered.contains(&atoms.UTF8_STRING));
		assert!(offered.contains(&atoms.STRING));
		assert!(offered.contains(&atoms.TEXT));
		assert!(offered.contains(&atoms.TEXT_MIME));
	}

	#[test]
	fn offered_atoms_for_image_is_canonical_only() {
		let atoms = fake_atoms();
		assert_eq!(format_to_offered_atoms(&atoms, ClipboardFormat::Image), vec![atoms.PNG]);
	}

	#[test]
	fn request_atom_for_text_prefers_utf8_string() {
		let atoms = fake_atoms();
		assert_eq!(format_to_request_atom(&atoms, ClipboardFormat::Text), atoms.UTF8_STRING);
	}

	#[test]
	fn chunk_size_floors_at_4096() {
		assert_eq!(1usize.max(MIN_CHUNK_SIZE), MIN_CHUNK_SIZE);
		assert_eq!((MIN_CHUNK_SIZE * 8).max(MIN_CHUNK_SIZE), MIN_CHUNK_SIZE * 8);
	}

	/// A payload exactly at the chunk size takes the single-shot reply path;
	/// one byte more forces INCR.
	#[test]
	fn incr_threshold_is_strictly_greater_than_chunk_size() {
		let chunk_size = MIN_CHUNK_SIZE;
		let single_shot = vec![0u8; chunk_size];
		let incr = vec![0u8; chunk_size + 1];
		assert!(single_shot.len() <= chunk_size);
		assert!(incr.len() > chunk_size);
	}
}
