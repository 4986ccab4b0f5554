use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use toolbridge_core::{Result, ToolbridgeError};
use tracing::{debug, info};

use crate::McpConfigDocument;

/// Where the configuration document lives.
///
/// Reads are expected to be cheap: the manager loads the document again
/// whenever it needs the current enablement state.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<McpConfigDocument>;
    fn save(&self, document: &McpConfigDocument) -> Result<()>;

    /// Load, modify and save as one step, returning the saved document.
    fn update(
        &self,
        modify: &mut dyn FnMut(&mut McpConfigDocument) -> Result<()>,
    ) -> Result<McpConfigDocument> {
        let mut document = self.load()?;
        modify(&mut document)?;
        self.save(&document)?;
        Ok(document)
    }
}

/// YAML file store. A missing file reads as an empty document.
pub struct YamlConfigStore {
    path: PathBuf,
    update_lock: Mutex<()>,
}

impl YamlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            update_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mcp_config.yaml".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for YamlConfigStore {
    fn load(&self) -> Result<McpConfigDocument> {
        if !self.path.exists() {
            debug!("Config file {:?} not found, using empty document", self.path);
            return Ok(McpConfigDocument::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            ToolbridgeError::Config(format!("Failed to read config file {:?}: {e}", self.path))
        })?;
        McpConfigDocument::from_yaml(&content)
    }

    fn save(&self, document: &McpConfigDocument) -> Result<()> {
        let yaml = document.to_yaml()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write then rename so readers never observe a half-written file.
        let temp = self.temp_path();
        fs::write(&temp, yaml)?;
        fs::rename(&temp, &self.path)?;

        info!("Saved MCP configuration to {:?}", self.path);
        Ok(())
    }

    fn update(
        &self,
        modify: &mut dyn FnMut(&mut McpConfigDocument) -> Result<()>,
    ) -> Result<McpConfigDocument> {
        let _guard = self
            .update_lock
            .lock()
            .map_err(|_| ToolbridgeError::Config("config store lock poisoned".into()))?;
        let mut document = self.load()?;
        modify(&mut document)?;
        self.save(&document)?;
        Ok(document)
    }
}

/// In-process store, mostly for tests and embedding.
#[derive(Default)]
pub struct MemoryConfigStore {
    document: Mutex<McpConfigDocument>,
    saves: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new(document: McpConfigDocument) -> Self {
        Self {
            document: Mutex::new(document),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Replace the stored document without counting it as a save.
    pub fn replace(&self, document: McpConfigDocument) {
        if let Ok(mut guard) = self.document.lock() {
            *guard = document;
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<McpConfigDocument> {
        self.document
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| ToolbridgeError::Config("config store lock poisoned".into()))
    }

    fn save(&self, document: &McpConfigDocument) -> Result<()> {
        let mut guard = self
            .document
            .lock()
            .map_err(|_| ToolbridgeError::Config("config store lock poisoned".into()))?;
        *guard = document.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(
        &self,
        modify: &mut dyn FnMut(&mut McpConfigDocument) -> Result<()>,
    ) -> Result<McpConfigDocument> {
        let mut guard = self
            .document
            .lock()
            .map_err(|_| ToolbridgeError::Config("config store lock poisoned".into()))?;
        let mut document = guard.clone();
        modify(&mut document)?;
        *guard = document.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(document)
    }
}
