pub mod fastforex;
pub mod server;
pub mod ws;
