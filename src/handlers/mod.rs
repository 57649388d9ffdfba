pub mod api;
pub mod image;
