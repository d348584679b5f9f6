mod build;
mod deployment;
mod domain;
mod project;
mod server;
mod vm;

pub use build::{Build, BuildStatus, Image};
pub use deployment::{Deployment, DeploymentStatus};
pub use domain::Domain;
pub use project::{Environment, EnvironmentVariable, Organisation, Project};
pub use server::{Region, Server, ServerStatus};
pub use vm::{Vm, VmLog, VmStatus};
