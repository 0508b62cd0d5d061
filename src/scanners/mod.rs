pub mod bundle;
pub mod headers;
pub mod secrets;
