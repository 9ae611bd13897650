pub mod domain;
pub mod error;
pub mod model;
pub mod protocol;
pub mod time;
