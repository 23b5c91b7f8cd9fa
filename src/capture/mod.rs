//! Capture of intercepted requests.

mod store;

pub use store::{CaptureId, CaptureStore, CapturedRequest};
