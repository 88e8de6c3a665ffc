pub mod approval;
pub mod envelope;
pub mod methods;
pub mod stream;

pub use approval::*;
pub use envelope::*;
pub use stream::*;
