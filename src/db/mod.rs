mod repository;
pub mod schema;

pub use repository::Repository;
