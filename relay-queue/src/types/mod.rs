pub mod ids;
pub mod clock;
pub mod record;
pub mod events;

pub use ids::{JobId, ReceiptHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use record::{HandleState, JobRecord};
pub use events::JobEvent;
