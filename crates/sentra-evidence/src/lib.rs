pub mod correlator;
pub mod db;
pub mod extract;
pub mod scorer;
pub mod search;
pub mod types;

pub use correlator::*;
pub use db::*;
pub use extract::*;
pub use scorer::*;
pub use search::*;
pub use types::*;
