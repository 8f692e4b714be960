//! Leases: the durable ownership records that partition work across hosts.
//!
//! ```text
//!  LeaseManager ──► LeaseUpdater ──► LeaseContainer (conditional replace)
//!       │
//!       └──► LeaseContainer (create / read / delete / prefix query)
//!
//!  LeaseStore ──► <prefix>.info / <prefix>.lock sentinels
//! ```

mod manager;
mod model;
mod store;
mod updater;

pub use manager::LeaseManager;
pub use model::{Lease, LEASE_ID_SEPARATOR};
pub use store::LeaseStore;
pub use updater::{LeaseUpdater, RETRY_COUNT_ON_CONFLICT};
