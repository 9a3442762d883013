pub mod admission;
pub mod job_store;
pub mod label_corpus;
pub mod memory_store;
pub mod pg_store;
pub mod process_launcher;
pub mod work_queue;

pub use admission::*;
pub use job_store::*;
pub use label_corpus::*;
pub use memory_store::*;
pub use pg_store::*;
pub use process_launcher::*;
pub use work_queue::*;
