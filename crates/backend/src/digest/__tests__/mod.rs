pub mod helpers;

mod operations;
mod properties;
