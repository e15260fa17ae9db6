// extract.rs
//
// Genotype extraction is delegated to an external tool (plink2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{Result, SplitError};
use crate::layout::NodeId;

/// Writes a genotype dataset at `out_prefix` restricted to the samples in `keep`
/// (tab-separated `FID`, `IID` with header).
pub trait GenotypeExtractor: Send + Sync {
    fn extract(&self, node: &NodeId, keep: &Path, out_prefix: &Path) -> Result<()>;
}

/// Serializes work per output prefix; different prefixes proceed concurrently.
#[derive(Debug, Default)]
struct PrefixLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PrefixLocks {
    fn lock_for(&self, prefix: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(prefix.to_path_buf()).or_default().clone()
    }
}

#[derive(Debug)]
pub struct Plink2Extractor {
    binary: String,
    source_flag: String,
    source: PathBuf,
    retries: u8,
    in_flight: PrefixLocks,
}

impl Plink2Extractor {
    pub fn new(binary: impl Into<String>, source_flag: impl Into<String>, source: impl Into<PathBuf>, retries: u8) -> Self {
        Self {
            binary: binary.into(),
            source_flag: source_flag.into(),
            source: source.into(),
            retries: retries.min(1),
            in_flight: PrefixLocks::default(),
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(&config.binary, &config.source_flag, &config.source, config.retries)
    }

    fn command(&self, keep: &Path, out_prefix: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg(&self.source_flag)
            .arg(&self.source)
            .arg("--out")
            .arg(out_prefix)
            .arg("--keep")
            .arg(keep)
            .arg("--make-pgen");
        command
    }

    fn run_once(&self, node: &NodeId, keep: &Path, out_prefix: &Path) -> Result<()> {
        let mut command = self.command(keep, out_prefix);
        debug!("Node {}: running {:?}", node, command);
        let output = command.output().map_err(|e| SplitError::ExternalTool {
            node: node.clone(),
            status: "failed to start".to_string(),
            diagnostics: format!("{}: {}", self.binary, e),
        })?;
        if output.status.success() {
            return Ok(());
        }
        Err(SplitError::ExternalTool {
            node: node.clone(),
            status: output.status.to_string(),
            diagnostics: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl GenotypeExtractor for Plink2Extractor {
    fn extract(&self, node: &NodeId, keep: &Path, out_prefix: &Path) -> Result<()> {
        let lock = self.in_flight.lock_for(out_prefix);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut attempt = 0;
        loop {
            match self.run_once(node, keep, out_prefix) {
                Ok(()) => {
                    info!("Node {}: genotypes written to {}", node, out_prefix.display());
                    return Ok(());
                }
                Err(err) if attempt < self.retries => {
                    warn!("Node {}: extraction failed, retrying once: {}", node, err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
