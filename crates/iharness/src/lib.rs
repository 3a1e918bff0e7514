//! iharness - icommands test harness
//!
//! Runs icommands as isolated client identities against a live service,
//! asserts on their output, watches the server log, and interrupts transfers
//! mid-flight.

pub mod executor;
pub mod interrupt;
pub mod log_monitor;
pub mod manager;
pub mod session;

pub use executor::{CommandEnv, CommandHandle, CommandSpec, ExecError, ProcessState};
pub use interrupt::{run_until_file_reaches_size, InterruptConfig, InterruptOutcome};
pub use log_monitor::{
    delay_assert, AssertionFailure, LogBookmark, LogMonitor, OccurrenceCheck, RetryPolicy,
};
pub use manager::{with_fixture, SessionFixture, SessionManager};
pub use session::{with_session, RunOptions, Session, SessionError, SessionState};
