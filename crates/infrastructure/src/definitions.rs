//! 工作流定义来源
//!
//! `FileDefinitionSource` 读取目录下的 `*.toml` / `*.json` 文件，每个文件一个工作流。
//! 目录按 `source_list_interval` 重新列出；单个文件只有在修改时间变化且距上次解析
//! 超过 `min_reload_interval` 时才重新解析。解析失败时保留该文件上一次成功的版本。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use orchestrator_core::{
    config::SchedulerConfig,
    models::WorkflowDefinition,
    traits::{DefinitionScan, DefinitionSource},
    DefinitionError, SchedulerError, SchedulerResult,
};

struct CachedFile {
    modified: Option<SystemTime>,
    parsed_at: Instant,
    definition: Option<WorkflowDefinition>,
    error: Option<DefinitionError>,
}

#[derive(Default)]
struct SourceState {
    files: Vec<PathBuf>,
    listed_at: Option<Instant>,
    cache: HashMap<PathBuf, CachedFile>,
}

pub struct FileDefinitionSource {
    dir: PathBuf,
    list_interval: Duration,
    min_reload_interval: Duration,
    state: Mutex<SourceState>,
}

impl FileDefinitionSource {
    pub fn new(
        dir: impl Into<PathBuf>,
        list_interval: Duration,
        min_reload_interval: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            list_interval,
            min_reload_interval,
            state: Mutex::new(SourceState::default()),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            &config.definitions_dir,
            Duration::from_secs(config.source_list_interval_seconds),
            Duration::from_secs(config.min_definition_reload_seconds),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn list_files(&self) -> SchedulerResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("定义目录不存在: {}", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SchedulerError::TransientInfra(format!(
                    "读取定义目录 {} 失败: {e}",
                    self.dir.display()
                )))
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            SchedulerError::TransientInfra(format!("读取定义目录失败: {e}"))
        })? {
            let path = entry.path();
            if is_definition_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("toml") | Some("json")
    )
}

/// 按扩展名解析单个定义文件
pub fn parse_definition(path: &Path, content: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let origin = path.display().to_string();
    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(content).map_err(|e| e.to_string()),
        _ => toml::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| DefinitionError::Parse { origin, message })
}

/// 读取目录下全部定义文件，不做缓存
pub async fn load_definitions_dir(dir: &Path) -> SchedulerResult<DefinitionScan> {
    FileDefinitionSource::new(dir, Duration::ZERO, Duration::ZERO)
        .scan()
        .await
}

#[async_trait]
impl DefinitionSource for FileDefinitionSource {
    async fn scan(&self) -> SchedulerResult<DefinitionScan> {
        let mut state = self.state.lock().await;
        let mut changed = state.listed_at.is_none();

        let relist = state
            .listed_at
            .map_or(true, |at| at.elapsed() >= self.list_interval);
        if relist {
            let files = self.list_files().await?;
            let before = state.cache.len();
            state.cache.retain(|path, _| files.contains(path));
            if state.cache.len() != before {
                info!("{} 个定义文件已被移除", before - state.cache.len());
                changed = true;
            }
            state.files = files;
            state.listed_at = Some(Instant::now());
        }

        let files = state.files.clone();
        for path in &files {
            let modified = tokio::fs::metadata(path)
                .await
                .ok()
                .and_then(|meta| meta.modified().ok());

            if let Some(cached) = state.cache.get(path) {
                let unchanged = cached.modified == modified;
                let too_soon = cached.parsed_at.elapsed() < self.min_reload_interval;
                if unchanged || too_soon {
                    continue;
                }
            }

            let parsed = match tokio::fs::read_to_string(path).await {
                Ok(content) => parse_definition(path, &content),
                Err(e) => Err(DefinitionError::Parse {
                    origin: path.display().to_string(),
                    message: e.to_string(),
                }),
            };

            let previous = state.cache.remove(path);
            let entry = match parsed {
                Ok(definition) => {
                    debug!("解析定义文件: {} -> {}", path.display(), definition.name);
                    let same = previous.as_ref().is_some_and(|p| {
                        p.error.is_none() && p.definition.as_ref() == Some(&definition)
                    });
                    if !same {
                        changed = true;
                    }
                    CachedFile {
                        modified,
                        parsed_at: Instant::now(),
                        definition: Some(definition),
                        error: None,
                    }
                }
                Err(error) => {
                    warn!("定义文件解析失败，保留上一个版本: {}", error);
                    if previous.as_ref().and_then(|p| p.error.as_ref()) != Some(&error) {
                        changed = true;
                    }
                    CachedFile {
                        modified,
                        parsed_at: Instant::now(),
                        definition: previous.and_then(|p| p.definition),
                        error: Some(error),
                    }
                }
            };
            state.cache.insert(path.clone(), entry);
        }

        let mut scan = DefinitionScan {
            changed,
            ..DefinitionScan::default()
        };
        for path in &state.files {
            if let Some(cached) = state.cache.get(path) {
                if let Some(definition) = &cached.definition {
                    scan.definitions.push(definition.clone());
                }
                if let Some(error) = &cached.error {
                    scan.errors.push(error.clone());
                }
            }
        }
        Ok(scan)
    }
}

/// 内存中的固定定义集合
#[derive(Default)]
pub struct StaticDefinitionSource {
    definitions: RwLock<Vec<WorkflowDefinition>>,
    changed: AtomicBool,
}

impl StaticDefinitionSource {
    pub fn new(definitions: Vec<WorkflowDefinition>) -> Self {
        Self {
            definitions: RwLock::new(definitions),
            changed: AtomicBool::new(true),
        }
    }

    pub async fn replace(&self, definitions: Vec<WorkflowDefinition>) {
        *self.definitions.write().await = definitions;
        self.changed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DefinitionSource for StaticDefinitionSource {
    async fn scan(&self) -> SchedulerResult<DefinitionScan> {
        Ok(DefinitionScan {
            definitions: self.definitions.read().await.clone(),
            errors: Vec::new(),
            changed: self.changed.swap(false, Ordering::SeqCst),
        })
    }
}
