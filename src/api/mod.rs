pub mod genibus;
pub mod utils;
