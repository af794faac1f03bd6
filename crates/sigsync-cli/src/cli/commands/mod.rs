pub mod digest;
pub mod regenerate;
pub mod status;
pub mod sync;
