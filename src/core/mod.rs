pub mod client;
pub mod drtest;
pub mod fanout;
pub mod lifecycle;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod progress;
pub mod provision;
pub mod provisioning;
pub mod restore;
pub mod runner;
pub mod safety;
pub mod scheduler;

pub use client::{Client, ClientStatus, DrTestFrequency, TerraformState};
pub use drtest::{DrComplianceReport, DrMetrics, DrTestHandle, DrTestReport, DrTestSummary};
pub use models::{Job, JobStatus, JobType, Provider, RestoreOptions};
pub use orchestrator::{JobHandle, JobOrchestrator, JobStatusReport, Paged};
pub use progress::{JobPhase, ProgressTracker};
pub use provision::ProvisionAction;
pub use provisioning::ProvisioningDriver;
pub use restore::{RestoreHandle, RestoreHistoryEntry};
pub use scheduler::{DrCadenceScheduler, SweepReport};
