//! Orchestration core: idle detection, work distribution, claims, the
//! per-session state machine and the run driver.

pub mod claims;
mod coordinator;
mod driver;
mod machine;
mod observer;

pub use claims::{Claim, ClaimAction, ClaimInbox, ClaimRequest, ClaimTable};
pub use coordinator::{Coordinator, DistributionPolicy};
pub use driver::{
    Orchestrator, Run, RunOptions, RunOutcome, RunReport, SessionReport, MAX_AGENTS,
};
pub use machine::{MachineContext, SessionMachine};
pub use observer::{Debounce, IdlePolicy, Observation, OutputObserver, Verdict};
