//! Budget-aware streaming chat: token estimation, history reduction, a
//! cancellable streaming controller and a windowed transcript view.

pub mod config;
pub mod context;
pub mod conversation;
pub mod models;
pub mod providers;
pub mod reduce;
pub mod sanitize;
pub mod session;
pub mod stream;
pub mod task;
pub mod window;
