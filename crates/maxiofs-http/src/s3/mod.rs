//! The S3-compatible data plane.

pub mod handlers;
pub mod headers;
pub mod operations;
pub mod router;
pub mod service;
pub mod xml;

pub use operations::S3Operation;
pub use router::{RoutingContext, S3Router};
pub use service::S3Service;
