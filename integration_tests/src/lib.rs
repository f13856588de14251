//! Test support: a simulated CANopen slave and a simulated bus for driving
//! the master stack end to end.

pub mod sim_bus;
pub mod sim_slave;
