//! CLI command implementations

pub mod checkpoints;
pub mod run;
pub mod validate;

pub use checkpoints::CheckpointsArgs;
pub use run::RunArgs;
pub use validate::ValidateArgs;
