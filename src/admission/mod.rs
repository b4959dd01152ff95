//! Admission control for LVMCluster writes
//!
//! Stateless validation of the desired storage topology, shared by the
//! admission webhook endpoint.

pub mod validator;

pub use validator::{
    validate_create, validate_spec, validate_update, ValidationError, ValidationResult,
};
