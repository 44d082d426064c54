pub mod cluster;
pub mod cmd;
pub mod error;
pub mod lock;
pub mod partition;
pub mod server;
pub mod telemetry;
pub mod test_utils;
pub mod utils;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
