//! dspp core library
//!
//! Compiles a set of compose fragments into one canonical swarm stack and
//! reconciles it against the orchestrator:
//! fragment merge, interpolation, config/secret resolution into a
//! content-addressable store, volume identity, plan/apply and the state codec.

pub mod cas;
pub mod codec;
pub mod compile;
pub mod config;
pub mod document;
pub mod error;
pub mod format;
pub mod interpolate;
pub mod observability;
pub mod paths;
pub mod reconcile;
pub mod resolver;
pub mod secrets;
pub mod volumes;

// Re-export commonly used items
pub use cas::{CasEntry, CasStore};
pub use compile::{CompiledStack, Compiler, EntityKind, EntitySlice, LocalAnalysis, SliceFilter};
pub use config::Config;
pub use error::{DsppError, Result};
pub use format::{format_stack, FormattedStack, DSPP_VERSION};
pub use observability::init as init_observability;
pub use reconcile::{
    ApplyReport, Approver, AutoApprove, ConfigFilter, ControlPlane, Plan, PlanStatus, Reconciler,
    RemoteConfig, RemoteResponse, RemoteTask,
};
pub use resolver::{GenerateContext, Generator, GeneratorRegistry};
pub use secrets::{DefaultSecretsProvider, NoSecrets, SecretsProvider};
