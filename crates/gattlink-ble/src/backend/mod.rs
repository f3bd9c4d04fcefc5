//! Native transport backends

mod btleplug_central;

pub use self::btleplug_central::BtleplugCentral;
