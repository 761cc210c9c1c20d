//! # genwire-client
//!
//! Network side of the generation protocol:
//!
//! - [`session::SessionManager`]: one coalesced session fetch, renewal, persistence
//! - [`http::ApiClient`]: `POST /API/<Method>` with a single retry on an invalid session
//! - [`runner::StreamRunner`]: one WebSocket per generation, folded into the [`jobs::JobStore`]
//! - [`dispatch`]: frame classification and listener fan-out
//! - [`generate::Generator`]: stream first, blocking HTTP when the stream will not open

#![deny(unsafe_code)]

pub mod dispatch;
pub mod generate;
pub mod http;
pub mod jobs;
pub mod runner;
pub mod session;
pub mod storage;

pub use dispatch::{decode_frame, Dispatcher, Subscription};
pub use generate::{GenerateOptions, GenerationOutcome, Generator};
pub use http::{api_url, build_http_client, ApiClient};
pub use jobs::{JobStore, JobUpdate};
pub use runner::{ConnectionState, EventCallback, JobHandle, RunOptions, StreamRunner};
pub use session::{HttpSessionSource, SessionManager, SessionSource};
pub use storage::{FileSessionStorage, MemorySessionStorage, SessionStorage};
