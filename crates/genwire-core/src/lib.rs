pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod params;
pub mod session;

pub use errors::{ClientError, Result};
pub use events::{BackendStatus, ProtocolEvent};
pub use ids::RequestId;
pub use job::{normalize_percent, Job, JobStatus, ProgressUpdate};
pub use params::{take_image_count, ControlNetSlot, FlatParams, GenerationParams, LoraSlot};
pub use session::Session;
