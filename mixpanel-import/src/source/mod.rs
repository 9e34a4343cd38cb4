pub mod api;
pub mod stream;

pub use api::{export_params, MixpanelApi};
pub use stream::EventStream;
