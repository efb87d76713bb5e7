mod frame;
mod handler;

pub use frame::{ClientFrame, ServerFrame};
pub use handler::ws_handler;
