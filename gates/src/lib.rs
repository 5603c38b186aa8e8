//! Change-budget governance engine.
//!
//! A unit of work declares a risk tier; the tier policy supplies a baseline
//! budget (max files touched, max lines changed); audited, time-boxed
//! waivers can relax that budget. This crate owns the waiver model and
//! schema validation, the keyed waiver store, the pure lifecycle evaluation,
//! the budget derivation engine, and the append-only audit trail.

use thiserror::Error;

pub mod audit;
pub mod budget;
pub mod lifecycle;
pub mod store;
pub mod waiver;

pub use policy_loader::{PolicyDocument, TierPolicy, WaiverApprovalPolicy};

use waiver::FieldViolation;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("unknown risk tier {tier}: the policy defines tiers {defined:?}")]
    UnknownTier { tier: u8, defined: Vec<u8> },

    #[error("waiver '{id}' not found in the active store")]
    WaiverNotFound { id: String },

    #[error("waiver rejected: {} field(s) failed validation", violations.len())]
    WaiverInvalid { violations: Vec<FieldViolation> },

    #[error("gate '{gate}' is already claimed by active waiver '{conflicts_with}'")]
    WaiverConflict {
        id: String,
        gate: String,
        conflicts_with: String,
    },

    #[error("waiver id space exhausted: every id up to WV-9999 is in use")]
    IdSpaceExhausted,

    #[error(
        "waiver store changed underneath this operation: loaded revision {loaded}, on-disk revision {on_disk}"
    )]
    StoreConflict { loaded: u64, on_disk: u64 },

    #[error(transparent)]
    Policy(#[from] policy_loader::PolicyError),

    #[error("I/O failed for '{path}': {message}")]
    Io { path: String, message: String },

    #[error("failed to parse '{path}': {message}")]
    Parse { path: String, message: String },
}
