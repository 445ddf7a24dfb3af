//! On-card filesystem: packed items (§3 "Files"), the disk/tree store and
//! its lookup tables (§3 "Disk & trees", "Lookup tables"), and the virtual
//! address state machine (§3 "Virtual address").

pub mod disk;
pub mod item;
pub mod lut;
pub mod va;

pub use disk::{Disk, DiskBuilder, Tree, DEPTH_MAX, DISK_MAGIC};
pub use item::{AdfAid, File, FileExtra, ItemHeader, ItemType, Lcs, FID_MF};
pub use va::{PathType, Va};
