//! Append-only volume storage for Haybale
//!
//! A store owns a directory of volume files. Each volume is a sequence of
//! needles (length-prefixed, self-describing records). Writes only extend
//! the active volume; deletes are tombstone needles; sealed volumes are
//! reclaimed by compaction. The in-memory index is rebuilt from the volume
//! files on startup with last-wins semantics.

pub mod compact;
pub mod index;
pub mod needle;
pub mod store;
pub mod volume;

pub use index::{IndexEntry, VolumeIndex};
pub use needle::{Needle, NEEDLE_OVERHEAD};
pub use store::{EngineConfig, StoreEngine};
pub use volume::Volume;
