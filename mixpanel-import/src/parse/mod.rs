pub mod escape;
pub mod record;
pub mod schema;
