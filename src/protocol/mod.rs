pub mod genibus;
