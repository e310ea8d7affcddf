#![allow(async_fn_in_trait)]
pub mod archive;
pub mod copernicus;
pub mod credentials;
pub mod dem;
pub mod download_plan;
pub mod error;
pub mod geometry;
pub mod inventory;
pub mod remote;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod settings;
pub mod tile_index;
pub mod token;
pub mod work_list;
