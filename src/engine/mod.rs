pub mod defaults;
pub mod exploit;
pub mod payload;
pub mod session;
