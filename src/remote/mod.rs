pub mod executor;
pub mod ops;
pub mod os;
pub mod sync;

pub use executor::{CommandExecutor, CommandOutput, Completion, OutputSink, RunOptions};
pub use ops::{ping, HostOps};
pub use os::{OsCapabilities, RemoteOs};
pub use sync::FileSync;
