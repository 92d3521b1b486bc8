//! Sorted collection recovery
//!
//! On restart the engine re-creates its in-memory indices from the durable
//! record heap. The scan pass feeds every candidate record into the
//! rebuilder (`add_header` / `add_element`), uncommitted batch entries are
//! rolled back, and `rebuild` then produces the live collection directory:
//!
//! 1. Linkage check and repair on every ingested record
//! 2. Header classification against the checkpoint
//! 3. Parallel index reconstruction, segment- or list-partitioned
//! 4. Reclamation of records and collections that did not survive

mod linkage;
mod rebuilder;

pub use linkage::RecoveryLinkage;
pub use rebuilder::{RebuildResult, RecoveryOptions, SortedRebuilder};
