// ==========================================
// 价目表导入系统 - 列映射学习存储
// ==========================================
// InMemoryLearningStore: 测试 / 无持久化场景
// JsonFileLearningStore: serde_json 文件，临时文件 + rename 原子写入
// SQLite 实现见 repository/mapping_feedback_repo.rs
// ==========================================

use crate::importer::error::{ImportError, ImportResult};
use crate::importer::price_list_importer_trait::{LearnedWeight, LearningStore};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

fn upsert(weights: &mut Vec<LearnedWeight>, weight: &LearnedWeight) {
    match weights
        .iter_mut()
        .find(|w| w.header_key == weight.header_key && w.field == weight.field)
    {
        Some(existing) => *existing = weight.clone(),
        None => weights.push(weight.clone()),
    }
}

// ==========================================
// 内存实现
// ==========================================
#[derive(Default)]
pub struct InMemoryLearningStore {
    weights: Mutex<Vec<LearnedWeight>>,
}

impl InMemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: Vec<LearnedWeight>) -> Self {
        Self {
            weights: Mutex::new(weights),
        }
    }
}

impl LearningStore for InMemoryLearningStore {
    fn load_all(&self) -> ImportResult<Vec<LearnedWeight>> {
        let weights = self
            .weights
            .lock()
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?;
        Ok(weights.clone())
    }

    fn save(&self, weight: &LearnedWeight) -> ImportResult<()> {
        let mut weights = self
            .weights
            .lock()
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?;
        upsert(&mut weights, weight);
        Ok(())
    }
}

// ==========================================
// JSON 文件实现
// ==========================================
pub struct JsonFileLearningStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileLearningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> ImportResult<Vec<LearnedWeight>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            ImportError::SystemError(format!("学习文件读取失败 {}: {}", self.path.display(), e))
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            ImportError::SystemError(format!("学习文件格式错误 {}: {}", self.path.display(), e))
        })
    }

    fn write_file(&self, weights: &[LearnedWeight]) -> ImportResult<()> {
        let json = serde_json::to_string_pretty(weights)
            .map_err(|e| ImportError::SystemError(format!("学习权重序列化失败: {}", e)))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .and_then(|_| std::fs::rename(&tmp_path, &self.path))
            .map_err(|e| {
                ImportError::SystemError(format!("学习文件写入失败 {}: {}", self.path.display(), e))
            })
    }
}

impl LearningStore for JsonFileLearningStore {
    fn load_all(&self) -> ImportResult<Vec<LearnedWeight>> {
        self.read_file()
    }

    fn save(&self, weight: &LearnedWeight) -> ImportResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?;
        let mut weights = self.read_file()?;
        upsert(&mut weights, weight);
        self.write_file(&weights)?;
        debug!(path = %self.path.display(), header = %weight.header_key, field = %weight.field, "学习权重已写入");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CanonicalField;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_upsert() {
        let store = InMemoryLearningStore::new();
        let mut weight = LearnedWeight::new("artnr", CanonicalField::Sku);
        weight.confirmations = 1;
        store.save(&weight).unwrap();
        weight.confirmations = 2;
        store.save(&weight).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].confirmations, 2);
    }

    #[test]
    fn test_json_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mapping_weights.json");

        let store = JsonFileLearningStore::new(&path);
        assert!(store.load_all().unwrap().is_empty());

        let mut weight = LearnedWeight::new("preis", CanonicalField::UnitPrice);
        weight.confirmations = 3;
        store.save(&weight).unwrap();

        let reopened = JsonFileLearningStore::new(&path);
        let all = reopened.load_all().unwrap();
        assert_eq!(all, vec![weight]);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
