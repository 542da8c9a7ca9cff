//! Domain model module declarations.

pub mod inbound;
pub mod outbound;
pub mod reverse;
pub mod session;
