pub mod btbr;
pub mod logging;
