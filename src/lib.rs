pub mod api;
pub mod app;
pub mod error;
pub mod lifecycle;
pub mod migrate;
pub mod mongo_ext;
pub mod util;
