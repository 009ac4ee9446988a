// ABOUTME: Workspace lifecycle controller for ephemeral per-project development containers
// ABOUTME: Provisions, drives, archives and restores workspaces behind a per-project registry

pub mod archive;
pub mod completion;
pub mod demux;
pub mod edit;
pub mod error;
pub mod files;
pub mod lifecycle;
pub mod object_store;
pub mod reclaimer;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shell;
pub mod store;
pub mod tools;

pub use archive::{archive_key, ArchivePipeline};
pub use edit::{EditError, MatchStrategy};
pub use error::{Result, WorkspaceError};
pub use files::{ChangeKind, FileChange, FileEntry};
pub use lifecycle::{ControllerSettings, WorkspaceController};
pub use object_store::{ObjectStore, ObjectStoreError, S3ObjectStore, S3Settings, UploadResult};
pub use reclaimer::{HeartbeatReclaimer, SweepReport};
pub use registry::{RegistryEntry, WorkspaceRegistry};
pub use runtime::{
    BoxedReader, ContainerDetails, ContainerRuntime, DockerRuntime, DockerSettings, OutputChunk,
    OutputStream, RuntimeError, StreamType, Workspace, WORKSPACE_DIR,
};
pub use session::{SessionContext, SessionRegistry, TodoItem, TodoPriority, TodoStatus};
pub use shell::{ExecOutput, ShellSession};
pub use store::{Project, ProjectStore, SqliteProjectStore, StorageError, WorkspaceStatus};
pub use tools::{AgentTools, EditReport};
