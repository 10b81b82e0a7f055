mod error;
pub use error::{ExecError, ExecResult};

mod util;
pub use util::{Termination, process_tree};

pub mod process;
pub use process::{ChildIo, ExitCallback, Liveness, ManagedProcess, MonitorConfig, ProcessSpec, StdioTarget};

pub mod pipe;
pub use pipe::{LineWriter, PipeChannel};

mod oneshot;
pub use oneshot::run_to_completion;

pub mod prelude {
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::pipe::{LineWriter, PipeChannel, drain_fifo, make_fifo, open_fifo_for_stdio, open_fifo_reader, open_fifo_writer};
    pub use crate::process::{ChildIo, ExitCallback, Liveness, ManagedProcess, MonitorConfig, ProcessSpec, StdioTarget};
    pub use crate::run_to_completion;
}
