mod dispatcher;
mod error;
mod request;

pub use dispatcher::{Dispatched, Dispatcher};
pub(crate) use error::detail_of;
pub use error::ApiError;
pub use request::{ApiResponse, PendingRequest, RequestBody};
pub use reqwest::{Method, StatusCode};
