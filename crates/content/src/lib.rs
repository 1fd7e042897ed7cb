pub mod archive;
pub mod metadata;
pub mod store;

pub use archive::{overlay_archive, OverlayStats};
pub use metadata::{fetch_captured_snapshot, load_captured_snapshot, DEFAULT_METADATA_PATH};
pub use store::{ResticStore, SnapshotStore, StoreError, StoreKind, StoreLocation};
