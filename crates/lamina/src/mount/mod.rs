//! Assembling and performing overlay mounts.
//!
//! This module handles:
//! - Splitting mount option strings into flags and data
//! - Building the overlay option string for a layer
//! - Choosing between a direct mount, the re-exec helper and a mount program
//! - Reference counting of merged directories

pub mod assemble;
pub mod options;
pub mod reexec;
pub mod refcount;
pub mod strategy;
pub mod syscall;

pub use assemble::{Lower, MountInput, MountPlan, plan_mount};
pub use options::{has_option, parse_mount_options, split_options};
pub use refcount::RefCounter;
pub use strategy::{
    DirectMount, MountBackend, MountFrom, MountProgram, MountRequest, MountStrategy,
    StrategyKind, SystemBackend, select_strategy, strategy_for,
};
