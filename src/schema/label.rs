use serde::{Deserialize, Serialize};

/// Labeled images of one class, as relative paths under the labeled-image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLabels {
    pub class_id: String,
    pub class_name: Option<String>,
    pub files: Vec<String>,
}

impl ClassLabels {
    pub fn sample_count(&self) -> usize {
        self.files.len()
    }
}
