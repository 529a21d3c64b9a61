//! Kubernetes access: clients, claim classification, pods, services, jobs and
//! port-forwarding.

pub mod client;
pub mod job;
pub mod pod;
pub mod portforward;
pub mod pvc;
pub mod service;

pub use client::{ClientIdentity, ClusterClient, get_client};
pub use job::wait_for_job;
pub use portforward::PortForward;
pub use pvc::{AffinityHint, PvcInfo, classify};
pub use service::{AddressPreference, format_ssh_target_host};
