//! The per-duty executors and the supporting duty/event plumbing.
//!
//! Each service follows the same shape: a builder, an `Inner` shared via
//! `Arc`, a `start_update_service` that spawns the timing loop, and
//! per-duty tasks spawned at the appropriate intra-slot offset.

pub mod attestation_service;
pub mod block_service;
pub mod duties_service;
pub mod event_service;
pub mod preparation_service;
pub mod sync_committee_service;
pub mod sync_duties;

pub use attestation_service::{AttestationService, AttestationServiceBuilder};
pub use block_service::{BlockService, BlockServiceBuilder, BlockServiceNotification};
pub use duties_service::{DutiesService, DutiesServiceBuilder, DutyAndProof};
pub use event_service::{EventService, EventServiceBuilder, HeadTracker};
pub use preparation_service::{PreparationService, PreparationServiceBuilder};
pub use sync_committee_service::SyncCommitteeService;
pub use sync_duties::SyncDutiesMap;
