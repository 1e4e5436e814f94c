//! Plugin descriptions, format backends and the known plugin list used by
//! Harmoniq Studio's scanner.

mod backend;
mod entry;
mod known_list;
mod scan;
mod shutdown;
mod store_json;
pub mod xml;

pub use backend::*;
pub use entry::*;
pub use known_list::*;
pub use scan::*;
pub use shutdown::*;
pub use store_json::*;
