pub mod ibroker;
pub mod memory;
