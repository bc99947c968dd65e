//! Printable views of dump replies.

mod policy;
mod sa;

pub use policy::{PolicyRecord, RequestRecord};
pub use sa::SaRecord;
