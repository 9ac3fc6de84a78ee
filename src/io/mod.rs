//! I/O layer - process management and the server pipe
//!
//! - **Process**: supervised and one-shot child processes
//! - **Process tree**: descendant discovery and tree-wide signalling
//! - **Pipe**: named pipe / Unix socket naming and connection

pub mod pipe;
pub mod process;
pub mod process_tree;

pub use process::{
    ChildProcessManager, CommandOptions, CommandOutcome, OutputConsumer, ProcessError,
    ProcessExit, ProcessState, StopMode, run_command,
};
