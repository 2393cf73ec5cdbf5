// ABOUTME: Sandbox capability layer for the Atelier action execution engine
// ABOUTME: Capability trait, local provider, shell command serializer, lifecycle supervisor

pub mod handle;
pub mod local;
pub mod shell;
pub mod supervisor;

pub use handle::{
    FsEvent, PatchOp, SandboxError, SandboxEvent, SandboxHandle, SandboxProvider, ShellIo,
    WatchOptions,
};
pub use local::{LocalProvider, LocalSandbox};
pub use shell::{CommandOutput, ShellError, ShellPool, ShellSession};
pub use supervisor::{SandboxSupervisor, SupervisorError};
