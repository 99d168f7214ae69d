//! `tasque-core`: identifiers and errors shared by the scheduler crates.
//!
//! Nothing in here touches storage or threads.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{InstanceId, OwnerId};
