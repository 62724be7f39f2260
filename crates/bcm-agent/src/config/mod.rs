pub mod cli;
pub mod labeler;
pub mod supervise;

pub use cli::*;
pub use labeler::*;
pub use supervise::*;
