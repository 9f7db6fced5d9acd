pub mod debmirror;
pub mod probe;
pub mod process;
pub mod reposync;
pub mod rsync;
pub mod toolset;

pub use debmirror::DebmirrorBackend;
pub use probe::{HttpMarkerProbe, RsyncMarkerProbe, UnavailableProbe};
pub use process::{RetryPolicy, ToolCommand, ToolRunner, ensure_dest_dir, is_redhat_family};
pub use reposync::ReposyncBackend;
pub use rsync::RsyncBackend;
pub use toolset::{ToolSet, ToolSettings};
