//! Read-only layers stored as composefs images.
//!
//! A layer manifest is turned into a single erofs image by the external
//! `mkcomposefs` helper. The image is mounted through a loop device and
//! serves as a lower whose file contents are redirected into the layer's
//! diff directory.

pub mod blob;
pub mod loopdev;

pub use blob::{
    BLOB_NAME, blob_path, enable_verity, generate_composefs_blob, has_acl, helper_path,
    mount_composefs_blob,
};
pub use loopdev::LoopDevice;
