//! Dependency engine - version ordering, declaration parsing, graph resolution

pub mod resolver;
pub mod spec;
pub mod version;

pub use resolver::{DependencyResolver, ResolutionResult};
pub use spec::{DependencyDeclaration, DependencyRelation, VersionOperator};
