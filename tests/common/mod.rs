#![allow(dead_code)]

mod setup_scanner;

pub use setup_scanner::*;
