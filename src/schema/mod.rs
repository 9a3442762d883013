pub mod job;
pub mod label;
pub mod model_version;
pub mod training_result;

pub use job::*;
pub use label::*;
pub use model_version::*;
pub use training_result::*;
