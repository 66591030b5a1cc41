//! Pixel memory shared between the host and the remote UI.
//!
//! Each resize allocates a new generation instead of growing the old one in
//! place: the renderer may still be painting into the previous generation,
//! so it stays mapped (and, for global identifiers, resolvable) until the
//! host retires it.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use thiserror::Error;

/// BGRA8 premultiplied.
pub const BYTES_PER_PIXEL: usize = 4;

const SHM_PREFIX: &str = const_str::concat!("/", crate::PROTOCOL_NAME, "-surface-");
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum SurfaceError {
	#[error("invalid surface size {width}x{height}")]
	InvalidSize { width: u32, height: u32 },
	#[error("surface has not been created")]
	NotCreated,
	#[error("operation needs the {0:?} backend")]
	WrongBackend(SurfaceBackend),
	#[error("capability surfaces are not supported on this platform")]
	Unsupported,
	#[error("no surface with id {0}")]
	UnknownSurface(SurfaceId),
	#[error("could not find a free surface id")]
	IdsExhausted,
	#[error("nix error: {0}")]
	Nix(#[from] nix::Error),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
}

/// Process-global, guessable name of one surface generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
	fn shm_name(self) -> String {
		format!("{SHM_PREFIX}{:08x}", self.0)
	}
}

impl fmt::Display for SurfaceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceBackend {
	/// Named shared memory any process can open by [`SurfaceId`].
	Global,
	/// Anonymous memory reachable only through a transferred descriptor.
	Capability,
}

impl SurfaceBackend {
	pub fn detect() -> Self {
		if cfg!(any(target_os = "linux", target_os = "android")) {
			Self::Capability
		} else {
			Self::Global
		}
	}
}

/// How a consumer finds a surface generation.
#[derive(Debug)]
pub enum SurfaceLocator {
	Global(SurfaceId),
	Capability(OwnedFd),
}

struct Mapping {
	ptr: NonNull<c_void>,
	len: usize,
}

// SAFETY: the mapping is plain shared memory owned by this value; access goes
// through &self / &mut self.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
	fn map(file: &File, len: usize) -> Result<Self, SurfaceError> {
		let length = NonZeroUsize::new(len).ok_or(SurfaceError::InvalidSize { width: 0, height: 0 })?;
		// SAFETY: a fresh MAP_SHARED mapping of a descriptor we hold open.
		let ptr = unsafe {
			mmap(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_SHARED,
				file,
				0,
			)
		}?;
		Ok(Self { ptr, len })
	}

	fn bytes(&self) -> &[u8] {
		// SAFETY: ptr..ptr+len stays mapped until drop.
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
	}

	fn bytes_mut(&mut self) -> &mut [u8] {
		// SAFETY: as above, and &mut self rules out other local borrows.
		unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
	}
}

impl Drop for Mapping {
	fn drop(&mut self) {
		// SAFETY: ptr/len came from a successful mmap and are unmapped once.
		if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
			tracing::warn!("munmap failed: {e}");
		}
	}
}

/// Unlinks the shm name on drop so the id stops resolving.
struct GlobalName(SurfaceId);

impl Drop for GlobalName {
	fn drop(&mut self) {
		if let Err(e) = shm_unlink(self.0.shm_name().as_str()) {
			tracing::warn!(id = %self.0, "shm_unlink failed: {e}");
		}
	}
}

struct Generation {
	number: u32,
	width: u32,
	height: u32,
	mapping: Mapping,
	file: File,
	global: Option<GlobalName>,
}

impl Generation {
	fn id(&self) -> Option<SurfaceId> {
		self.global.as_ref().map(|g| g.0)
	}
}

/// Owner side of a shared surface.
pub struct SharedSurface {
	backend: SurfaceBackend,
	current: Option<Generation>,
	superseded: Vec<Generation>,
	next_generation: u32,
}

impl fmt::Debug for SharedSurface {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SharedSurface")
			.field("backend", &self.backend)
			.field("generation", &self.generation())
			.field("size", &self.size())
			.field("superseded", &self.superseded.len())
			.finish()
	}
}

impl SharedSurface {
	pub fn new(backend: SurfaceBackend) -> Self {
		Self {
			backend,
			current: None,
			superseded: Vec::new(),
			next_generation: 1,
		}
	}

	pub fn backend(&self) -> SurfaceBackend {
		self.backend
	}

	/// Allocate generation 1, dropping anything allocated before.
	pub fn create(&mut self, width: u32, height: u32) -> Result<(), SurfaceError> {
		self.release();
		self.next_generation = 1;
		self.current = Some(self.allocate(width, height)?);
		Ok(())
	}

	/// Allocate the next generation and make it current. On failure the
	/// current generation is untouched. Returns the new generation number.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn resize(&mut self, width: u32, height: u32) -> Result<u32, SurfaceError> {
		if self.current.is_none() {
			return Err(SurfaceError::NotCreated);
		}
		let next = self.allocate(width, height)?;
		let number = next.number;
		if let Some(previous) = self.current.replace(next) {
			self.superseded.push(previous);
		}
		Ok(number)
	}

	/// Free generations older than the current one. Call once the consumer
	/// has switched to the current generation.
	pub fn retire_superseded(&mut self) -> usize {
		let retired = self.superseded.len();
		self.superseded.clear();
		retired
	}

	/// Free every generation.
	pub fn release(&mut self) {
		self.superseded.clear();
		self.current = None;
	}

	pub fn generation(&self) -> Option<u32> {
		self.current.as_ref().map(|g| g.number)
	}

	pub fn size(&self) -> Option<(u32, u32)> {
		self.current.as_ref().map(|g| (g.width, g.height))
	}

	/// Global identifier of the current generation.
	pub fn id(&self) -> Option<SurfaceId> {
		self.current.as_ref().and_then(Generation::id)
	}

	/// What a Resize event carries so the remote can find the current
	/// generation: the global id, or the generation counter for capabilities.
	pub fn generation_tag(&self) -> Option<u32> {
		let current = self.current.as_ref()?;
		Some(current.id().map_or(current.number, |id| id.0))
	}

	/// One-shot transferable descriptor for the current generation.
	pub fn create_capability(&self) -> Result<OwnedFd, SurfaceError> {
		if self.backend != SurfaceBackend::Capability {
			return Err(SurfaceError::WrongBackend(SurfaceBackend::Capability));
		}
		let current = self.current.as_ref().ok_or(SurfaceError::NotCreated)?;
		Ok(current.file.try_clone()?.into())
	}

	/// A mapping of the current generation independent of this owner.
	pub fn map_current(&self) -> Result<SurfaceRef, SurfaceError> {
		let current = self.current.as_ref().ok_or(SurfaceError::NotCreated)?;
		let locator = match current.id() {
			Some(id) => SurfaceLocator::Global(id),
			None => SurfaceLocator::Capability(current.file.try_clone()?.into()),
		};
		lookup(locator)
	}

	pub fn pixels(&self) -> Option<&[u8]> {
		self.current.as_ref().map(|g| g.mapping.bytes())
	}

	pub fn pixels_mut(&mut self) -> Option<&mut [u8]> {
		self.current.as_mut().map(|g| g.mapping.bytes_mut())
	}

	fn allocate(&mut self, width: u32, height: u32) -> Result<Generation, SurfaceError> {
		let len = (width as usize)
			.checked_mul(height as usize)
			.and_then(|px| px.checked_mul(BYTES_PER_PIXEL))
			.filter(|len| *len > 0)
			.ok_or(SurfaceError::InvalidSize { width, height })?;
		let (file, global) = match self.backend {
			SurfaceBackend::Global => {
				let (file, name) = open_global()?;
				(file, Some(name))
			}
			SurfaceBackend::Capability => (open_anonymous()?, None),
		};
		// `global` unlinks the name again if sizing or mapping fails.
		file.set_len(len as u64)?;
		if self.backend == SurfaceBackend::Capability {
			seal_size(&file)?;
		}
		let mapping = Mapping::map(&file, len)?;
		let number = self.next_generation;
		self.next_generation = self.next_generation.wrapping_add(1).max(1);
		tracing::debug!(generation = number, width, height, backend = ?self.backend, "allocated surface");
		Ok(Generation {
			number,
			width,
			height,
			mapping,
			file,
			global,
		})
	}
}

fn open_global() -> Result<(File, GlobalName), SurfaceError> {
	for _ in 0..MAX_ID_ATTEMPTS {
		let id = SurfaceId(rand::random::<u32>().max(1));
		match shm_open(
			id.shm_name().as_str(),
			OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
			Mode::S_IRUSR | Mode::S_IWUSR,
		) {
			Ok(fd) => return Ok((File::from(fd), GlobalName(id))),
			Err(Errno::EEXIST) => continue,
			Err(e) => return Err(e.into()),
		}
	}
	Err(SurfaceError::IdsExhausted)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_anonymous() -> Result<File, SurfaceError> {
	use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
	let fd = memfd_create(
		c"pane-surface",
		MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
	)?;
	Ok(File::from(fd))
}

/// Freeze the size so a peer holding the descriptor cannot truncate the
/// memory under a live mapping.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn seal_size(file: &File) -> Result<(), SurfaceError> {
	use nix::fcntl::{FcntlArg, SealFlag, fcntl};
	use std::os::fd::AsRawFd;
	let seals = SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_GROW | SealFlag::F_SEAL_SEAL;
	fcntl(file.as_raw_fd(), FcntlArg::F_ADD_SEALS(seals))?;
	Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn seal_size(_file: &File) -> Result<(), SurfaceError> {
	Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_anonymous() -> Result<File, SurfaceError> {
	Err(SurfaceError::Unsupported)
}

/// Consumer side mapping of one surface generation.
///
/// Resolve a fresh one on every generation change; an old reference keeps
/// showing the superseded pixels.
pub struct SurfaceRef {
	mapping: Mapping,
}

impl fmt::Debug for SurfaceRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SurfaceRef").field("len", &self.len()).finish()
	}
}

impl SurfaceRef {
	pub fn len(&self) -> usize {
		self.mapping.len
	}

	pub fn is_empty(&self) -> bool {
		self.mapping.len == 0
	}

	pub fn pixels(&self) -> &[u8] {
		self.mapping.bytes()
	}

	pub fn pixels_mut(&mut self) -> &mut [u8] {
		self.mapping.bytes_mut()
	}
}

pub fn lookup(locator: SurfaceLocator) -> Result<SurfaceRef, SurfaceError> {
	let file = match locator {
		SurfaceLocator::Global(id) => {
			match shm_open(id.shm_name().as_str(), OFlag::O_RDWR, Mode::empty()) {
				Ok(fd) => File::from(fd),
				Err(Errno::ENOENT) => return Err(SurfaceError::UnknownSurface(id)),
				Err(e) => return Err(e.into()),
			}
		}
		SurfaceLocator::Capability(fd) => File::from(fd),
	};
	let len = usize::try_from(file.metadata()?.len())
		.map_err(|_| SurfaceError::InvalidSize { width: 0, height: 0 })?;
	Ok(SurfaceRef {
		mapping: Mapping::map(&file, len)?,
	})
}
