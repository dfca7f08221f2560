//! Scoped mutable filesystem over a container image
//!
//! A [`Workspace`] is a cheap copy-on-write fork: the base image (template
//! files plus an image ref) is shared behind an `Arc`, while every fork
//! carries its own staged overlay and permission policy. Commands run
//! against base ⊕ overlay through a [`ContainerRuntime`], which is the seam
//! to the real container backend; the in-repo [`ProcessRuntime`]
//! materializes the view into a scratch directory and runs host processes.

pub mod postgres;
pub mod runtime;
pub mod workspace;

pub use postgres::{DisabledPostgres, DockerPostgres, PostgresHandle, PostgresProvisioner};
pub use runtime::{ContainerRuntime, ExecOutcome, ExecRequest, ExecResult, ProcessRuntime};
pub use workspace::{BaseImage, Workspace, WorkspaceError, WorkspaceResult};
