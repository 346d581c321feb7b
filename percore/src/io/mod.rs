pub mod priority;
pub mod properties;
pub mod queue;
pub mod request;

pub use priority::{register_priority_class, rename_priority_class, IoPriorityClass};
pub use properties::{DiskConfig, MountpointParams};
pub use queue::{IoIntent, IoQueue, IoQueueConfig};
pub use request::IoRequest;

use crate::error::Result;

/// An admitted request on its way to the backend, paired with the
/// completion that resolves the submitter's future.
pub struct PendingIo {
    pub request: IoRequest,
    pub completion: Box<dyn FnOnce(Result<usize>)>,
}

impl std::fmt::Debug for PendingIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingIo")
            .field("request", &self.request)
            .finish()
    }
}
