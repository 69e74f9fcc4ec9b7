//! CAEN V895 and V812 16 channel discriminators.
//!
//! The boards are write-mostly: every setting maps onto one register and
//! is written once at construction.

pub mod board;
pub mod spec;

pub use board::{Discriminator, DiscriminatorSetup, ModuleInfo};
pub use spec::{DiscriminatorModel, N_CHANNELS};
