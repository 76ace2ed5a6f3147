use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use orchestrator_core::{traits::DefinitionScan, DefinitionError};
use orchestrator_domain::WorkflowGraph;
use orchestrator_infrastructure::StructuredLogger;

/// 一次扫描应用到注册表后的变化
#[derive(Debug, Default)]
pub struct RegistryUpdate {
    pub loaded: Vec<String>,
    pub removed: Vec<String>,
    pub rejected: Vec<DefinitionError>,
}

/// 当前生效的工作流图
///
/// 某个工作流的新版本被拒绝时继续使用上一个有效版本。
#[derive(Default)]
pub struct WorkflowRegistry {
    graphs: RwLock<BTreeMap<String, Arc<WorkflowGraph>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_scan(&self, scan: DefinitionScan) -> RegistryUpdate {
        let mut rejected = scan.errors;
        let declared: HashSet<String> = scan
            .definitions
            .iter()
            .map(|d| d.name.trim().to_string())
            .collect();
        let (graphs, errors) = WorkflowGraph::load_all(scan.definitions);
        rejected.extend(errors);

        let mut current = self.graphs.write().await;
        let mut next = BTreeMap::new();
        let mut loaded = Vec::new();
        for graph in graphs {
            let name = graph.name().to_string();
            let same = current
                .get(&name)
                .is_some_and(|old| old.definition() == graph.definition());
            if !same {
                loaded.push(name.clone());
            }
            next.insert(name, Arc::new(graph));
        }

        for error in &rejected {
            StructuredLogger::log_definition_rejected(error.workflow(), &error.to_string());
            let name = error.workflow();
            if next.contains_key(name) {
                continue;
            }
            if let Some(previous) = current.get(name) {
                warn!("工作流 {} 的新版本被拒绝，继续使用上一个有效版本", name);
                next.insert(name.to_string(), previous.clone());
            }
        }

        let removed: Vec<String> = current
            .keys()
            .filter(|name| !next.contains_key(*name) && !declared.contains(*name))
            .cloned()
            .collect();
        for name in &removed {
            info!("工作流已移除: {}", name);
        }
        for name in &loaded {
            info!("工作流已加载: {}", name);
        }

        *current = next;
        RegistryUpdate {
            loaded,
            removed,
            rejected,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<WorkflowGraph>> {
        self.graphs.read().await.get(name).cloned()
    }

    /// 按名称排序
    pub async fn all(&self) -> Vec<Arc<WorkflowGraph>> {
        self.graphs.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.graphs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.graphs.read().await.is_empty()
    }
}
