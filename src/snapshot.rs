//! The snapshot store is an external collaborator (§1): it persists snapshot
//! metadata and manages working-set/mincore files. The core only needs the narrow
//! set of operations named in §4.6 and §6, so `Snapshot` is an opaque trait object
//! rather than a type this crate constructs or owns.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

/// The operations the VM controller needs from a snapshot, regardless of how the
/// embedder's snapshot store represents one internally.
pub trait SnapshotHandle: Send + Sync {
    /// The logical function this snapshot was taken for.
    fn function(&self) -> &str;

    fn snapshot_path(&self) -> &Path;

    /// Present only when the invocation opts into file-backed guest memory.
    fn mem_file_path(&self) -> Option<&Path>;

    fn has_mincore_layers(&self) -> bool;

    /// The one-shot warm-up latch: at most one warm-up runs per snapshot across all
    /// concurrent `LoadSnapshot` calls referring to it (§5).
    fn warm_up_latch(&self) -> &tokio::sync::OnceCell<()>;

    fn load_ws_file(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn load_mincore(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Fire off the speculative warm-up for `snapshot` in the background, at most once
/// per snapshot. Callers never await this: `LoadSnapshot` proceeds immediately
/// regardless of warm-up progress (§4.6 step 1).
pub fn trigger_warm_up(snapshot: Arc<dyn SnapshotHandle>, use_ws_file: bool) {
    if !snapshot.has_mincore_layers() {
        return;
    }
    tokio::spawn(async move {
        snapshot
            .warm_up_latch()
            .get_or_init(|| async {
                if use_ws_file {
                    snapshot.load_ws_file().await;
                } else {
                    snapshot.load_mincore().await;
                }
            })
            .await;
    });
}
