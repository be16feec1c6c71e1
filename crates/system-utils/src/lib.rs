pub mod net;
pub mod path;
pub mod process;
