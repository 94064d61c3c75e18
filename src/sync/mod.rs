//! Getting offline form submissions to the server eventually.

mod connectivity;
mod coordinator;

pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, Transition};
pub use coordinator::{DrainReport, FormSubmission, SubmitOutcome, SyncCoordinator};
