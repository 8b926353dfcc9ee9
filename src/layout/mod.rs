//! Layout descriptors for locating typed sub-arrays inside a segment
//!
//! Every published segment starts with a serialized [`DataLayout`]: an
//! ordered mapping from block names to element counts and byte sizes. A
//! consumer that can see the first byte of a segment can decode the layout
//! and derive a typed pointer to any block in the body.

pub mod block;
pub mod descriptor;

pub use block::{align_up, Block, BLOCK_ALIGNMENT, MAX_BLOCK_NAME_LEN};
pub use descriptor::{DataLayout, DEFAULT_LAYOUT_SIZE_CAP};
