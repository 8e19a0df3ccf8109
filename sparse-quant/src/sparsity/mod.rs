//! Scheduled structured sparsity.
//!
//! A [`Sparsifier`] keeps a binary mask per weight and recomputes it on a
//! step schedule:
//!
//! ```text
//! target_step = base_target_step + mask_update_interval * mask_update_count
//! update      = step == target_step
//!               && (num_shots == -1 || mask_update_count < num_shots)
//!               && layer_idx in sparsified_layers
//! ```
//!
//! On an update, the `n` lowest-scoring elements of every block of `m`
//! (along the last axis) are pruned.

mod mask;
mod schedule;
mod score;
mod sparsifier;
mod state;

pub use mask::{apply_sparsity, mask_sparsity, nm_mask, reshape_mask};
pub use schedule::{next_target_step, should_update_mask, ScheduleState};
pub use score::compute_score;
pub use sparsifier::Sparsifier;
pub use state::{mask_name, LayerSparsityState, LayerStates};
