//! # Collaborator interfaces
//!
//! The scheduler never touches a device API or a decoding algorithm
//! directly. It drives three traits:
//!
//! - [`ScoringModel`] runs the forward pass on the accelerator and reports
//!   the device facts used for batch sizing
//! - [`Submission`] is the issued forward pass, to which the two scan
//!   kernels are appended per buffer split before it is committed
//! - [`Decoder`] turns one chunk's scores, backward guides and posteriors
//!   into a sequence, quality string and move table
//!
//! Any closure of the right shape is a [`Decoder`].

mod core_trait;

pub use core_trait::*;

#[cfg(test)]
/// Instrumented fakes for the collaborator traits.
pub(crate) mod mock;
