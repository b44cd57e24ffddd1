//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async CRUD methods
//! that accept `&PgPool` as the first argument.

pub mod map_result_repo;
pub mod render_job_repo;

pub use map_result_repo::MapResultRepo;
pub use render_job_repo::RenderJobRepo;
