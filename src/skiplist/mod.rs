//! Sorted collections: skip lists over durable record chains
//!
//! A sorted collection is a doubly-linked circular list of durable records
//! (level 1) indexed by an in-memory tower of forward pointers. Towers are
//! probabilistic: only a fraction of elements get an in-memory node at all,
//! and node heights follow a geometric draw.

mod list;
mod node;

pub use list::{
    decode_collection_value, encode_collection_value, encode_internal_key, extract_id,
    extract_user_key, ChainIter, Skiplist, SortedCollectionConfigs, Splice,
};
pub use node::{new_node_build, SkiplistNode};
