pub mod page;
pub mod server;
pub mod transport;
pub mod ui;
