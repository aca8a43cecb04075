#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod browser_controller;
pub mod checkpoint;
pub mod converter;
pub mod crawler;
pub mod downloader;
pub mod file_discovery;
pub mod listing;
pub mod metadata;
pub mod pagination;
pub mod runner;
pub mod table;
pub mod types;
pub mod utils;
