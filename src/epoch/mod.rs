//! Epoch-based memory reclamation for the tag index
//!
//! Overflow buckets and retired table generations are only freed once no
//! thread can still be reading them. Every index operation runs inside an
//! [`EpochGuard`]; memory unlinked while others may be reading is handed to
//! [`LightEpoch::bump_current_epoch_with_action`].

mod light_epoch;

pub use light_epoch::{get_thread_id, EpochAction, EpochGuard, LightEpoch, UNPROTECTED};
