pub mod billing;
pub mod db;
pub mod editor;
pub mod error;
pub mod import;
pub mod models;
pub mod service;

pub use error::{Error, Result};
