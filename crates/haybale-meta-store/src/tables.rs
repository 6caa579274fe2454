//! Redb table definitions for persistent directory metadata.

use redb::TableDefinition;

/// Photo records, keyed by photo id; values are bincode-encoded
/// `PhotoRecord`s
pub const PHOTOS: TableDefinition<u64, &[u8]> = TableDefinition::new("photos");

/// Store-wide counters; currently only the photo id sequence
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the next-photo-id sequence in [`META`]
pub const NEXT_PHOTO_ID: &str = "next_photo_id";
