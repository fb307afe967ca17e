//! GameCube memory-card file system.
//!
//! [`CardSystem`] drives up to two card slots through an [`ExiBus`]: it
//! mounts and unlocks cards, keeps the redundant directory and FAT copies
//! consistent, and creates, reads, writes and deletes files. Long-running
//! operations come in a blocking form and an `_async` form that reports to a
//! callback; the latter advance through [`CardSystem::poll`].
//!
//! [`SimBus`] and [`SimCard`] emulate the slot hardware on top of an
//! in-memory or file-backed image.

pub mod bus;
mod check;
pub mod checksum;
pub mod clock;
pub mod dir;
pub mod error;
pub mod fat;
mod file;
mod format;
pub mod geometry;
pub mod id;
pub mod layout;
mod mount;
mod persist;
mod rdwr;
pub mod sim;
pub mod sram;
pub mod stat;
pub mod store;
pub mod system;
pub mod unlock;

pub use bus::{ExiBus, Probe};
pub use clock::{Clock, StepClock, SystemClock};
pub use dir::{DirEntry, DiskId};
pub use error::{CardError, CardResult};
pub use geometry::Geometry;
pub use sim::{SimBus, SimCard};
pub use sram::{IdentityStore, Sram};
pub use stat::CardStat;
pub use store::{BackingStore, ImageFile, MemStore};
pub use system::{CardCallback, CardSystem, Completion, FileInfo, MountState};
