pub mod atomic;
pub mod catalog;
pub mod config;
pub mod conflict;
pub mod db;
pub mod drive;
pub mod error;
pub mod hash;
pub mod ignore;
pub mod lock;
pub mod migrate;
pub mod models;
pub mod paths;
pub mod relink;
pub mod scan;
pub mod sync;

pub use crate::error::{Error, Result};
pub use crate::models::*;
