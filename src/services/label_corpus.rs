use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::schema::ClassLabels;

/// Read-only view over the labeled samples available for training.
#[async_trait::async_trait]
pub trait LabelCorpus: Send + Sync {
    async fn get_label_count(&self) -> anyhow::Result<i64>;
    /// Classes with at least `min_samples` labels, largest first.
    async fn get_labels_grouped_by_class(
        &self,
        min_samples: usize,
    ) -> anyhow::Result<Vec<ClassLabels>>;
}

/// Labels laid out on disk as `<root>/<class>/<image>`.
pub struct DirectoryLabelCorpus {
    root: PathBuf,
}

impl DirectoryLabelCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn scan(&self) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
        let mut classes = BTreeMap::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(root = %self.root.display(), "labels: labeled directory missing");
                return Ok(classes);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let class_id = dir.file_name().to_string_lossy().into_owned();
            let mut files = Vec::new();
            let mut images = tokio::fs::read_dir(dir.path()).await?;
            while let Some(image) = images.next_entry().await? {
                if image.file_type().await?.is_file() && !is_hidden(&image.path()) {
                    files.push(format!(
                        "{class_id}/{}",
                        image.file_name().to_string_lossy()
                    ));
                }
            }
            files.sort();
            classes.insert(class_id, files);
        }
        Ok(classes)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl LabelCorpus for DirectoryLabelCorpus {
    async fn get_label_count(&self) -> anyhow::Result<i64> {
        let classes = self.scan().await?;
        Ok(classes.values().map(|files| files.len() as i64).sum())
    }

    async fn get_labels_grouped_by_class(
        &self,
        min_samples: usize,
    ) -> anyhow::Result<Vec<ClassLabels>> {
        let mut groups: Vec<ClassLabels> = self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, files)| files.len() >= min_samples)
            .map(|(class_id, files)| ClassLabels {
                class_id,
                class_name: None,
                files,
            })
            .collect();
        groups.sort_by(|a, b| b.sample_count().cmp(&a.sample_count()));
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "aerotrain-labels-{name}-{}",
            uuid::Uuid::new_v4().as_simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(root: &Path, class: &str, file: &str) {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), b"jpeg").unwrap();
    }

    #[tokio::test]
    async fn counts_and_groups_by_class_directory() {
        let root = corpus_dir("group");
        for n in 0..3 {
            touch(&root, "A320", &format!("{n}.jpg"));
        }
        touch(&root, "B737", "0.jpg");
        touch(&root, "B737", ".DS_Store");
        std::fs::write(root.join("stray.txt"), b"x").unwrap();

        let corpus = DirectoryLabelCorpus::new(&root);
        assert_eq!(corpus.get_label_count().await.unwrap(), 4);

        let groups = corpus.get_labels_grouped_by_class(1).await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].class_id, "A320");
        assert_eq!(groups[0].files[0], "A320/0.jpg");

        let groups = corpus.get_labels_grouped_by_class(2).await.unwrap();
        assert_eq!(groups.len(), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn missing_root_is_an_empty_corpus() {
        let corpus = DirectoryLabelCorpus::new("/tmp/aerotrain-labels-does-not-exist");
        assert_eq!(corpus.get_label_count().await.unwrap(), 0);
        assert!(corpus.get_labels_grouped_by_class(1).await.unwrap().is_empty());
    }
}
