pub mod call;
pub mod error;
pub mod history;
pub mod resource;
pub mod schedule;

pub use call::{
    Admission, CallDependency, CallId, CallReport, CallRequest, CallState, CallTarget,
    LifecycleEvent, LifecycleHooks,
};
pub use error::{SiloError, SiloResult};
pub use history::{ArchiveFilter, ArchivedCall, TaskResourceRecord};
pub use resource::{ConflictReason, ResourceOperation, ResourceSet, ResourceType};
pub use schedule::{CallTemplate, IsoDuration, ScheduleId, ScheduleSpec, ScheduledCall};
