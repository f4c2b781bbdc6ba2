pub mod gate;
pub mod transport;
