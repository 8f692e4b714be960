//! Feed ranges and per-partition read state.

mod range;
mod state;

pub use range::{FeedRange, PartitionKeyRange, Range, MAX_EXCLUSIVE, MIN_INCLUSIVE};
pub use state::{
    ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedState, ContinuationEntry, STATE_VERSION,
};
